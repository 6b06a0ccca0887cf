use crate::cli::BuildOptions;
use anyhow::Result;
use forest_index_common::dataset::build_index;
use forest_index_common::settings::Settings;
use log::info;

pub fn run(options: BuildOptions) -> Result<()> {
    let settings = Settings::load_from_data_folder(&options.data_dir).unwrap_or_default();

    info!(
        "building index from {} into {}",
        options.input.display(),
        options.data_dir.display()
    );
    build_index(options.input, &options.data_dir, settings)?;
    info!("build complete");
    Ok(())
}
