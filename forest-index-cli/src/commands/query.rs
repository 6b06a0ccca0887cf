use crate::cli::{QueryOptions, RegionArg};
use anyhow::Result;
use forest_index_common::dataset::{run_query_capped, Dataset};
use forest_index_common::geometry::bounding_box::Aabb;
use forest_index_common::nalgebra::Point3;
use forest_index_common::query::{ClassificationMask, QueryWhere, RegionShape};
use log::info;

pub fn run(options: QueryOptions) -> Result<()> {
    let mut dataset = Dataset::open(&options.data_dir)?;

    let region = match options.region {
        RegionArg::Box {
            min_x,
            min_y,
            min_z,
            max_x,
            max_y,
            max_z,
        } => RegionShape::Box(Aabb::new(
            Point3::new(min_x, min_y, min_z),
            Point3::new(max_x, max_y, max_z),
        )),
        RegionArg::Sphere {
            center_x,
            center_y,
            center_z,
            radius,
        } => RegionShape::Sphere {
            center: Point3::new(center_x, center_y, center_z),
            radius,
        },
    };

    let classification = if options.classification.is_empty() {
        ClassificationMask::all()
    } else {
        let mut mask = ClassificationMask::none();
        for code in &options.classification {
            mask.set(*code, true);
        }
        mask
    };

    let where_ = QueryWhere {
        region,
        classification,
        ..QueryWhere::default()
    };

    let mut printed = 0;
    let count = run_query_capped(&mut dataset, &where_, options.maximum_results, |m| {
        println!(
            "{:>6} page={:?} ({:.3}, {:.3}, {:.3}) class={} segment={}",
            printed, m.page, m.point.position.x, m.point.position.y, m.point.position.z, m.point.classification, m.attributes.segment_id
        );
        printed += 1;
    })?;

    if let Some(max) = options.maximum_results {
        if count >= max {
            info!("stopped after reaching maximum_results={max}");
        }
    }
    info!("{count} matching point(s)");
    Ok(())
}
