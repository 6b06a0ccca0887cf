use crate::cli::InitOptions;
use anyhow::{bail, Result};
use forest_index_common::settings::{ColorSource, Settings};
use log::info;

pub fn run(options: InitOptions) -> Result<()> {
    if options.data_dir.join("settings.json").exists() {
        bail!(
            "{} already contains a settings.json - remove it first if you want to re-initialize",
            options.data_dir.display()
        );
    }
    std::fs::create_dir_all(&options.data_dir)?;

    let settings = Settings {
        randomize_points: options.randomize_points,
        convert_to_version_1_4: options.convert_to_version_1_4,
        copy_extra_bytes: options.copy_extra_bytes,
        max_index_l1_size: options.max_index_l1_size,
        max_index_l1_level: options.max_index_l1_level,
        max_index_l2_size: options.max_index_l2_size,
        max_index_l2_level: options.max_index_l2_level,
        buffer_size: 1 << 20,
        cache_bytes: options.cache_bytes,
        color_source: ColorSource::Native,
    };
    settings.save_to_data_folder(&options.data_dir)?;

    info!("initialized {}", options.data_dir.display());
    Ok(())
}
