use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// A tool to build and query a two-level octree index over terrestrial lidar forest scans.
#[derive(Debug, Parser)]
pub struct ForestIndexOptions {
    /// Verbosity of the command line output.
    #[clap(long, default_value = "info")]
    pub log_level: log::Level,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
#[allow(clippy::large_enum_variant)] // this is ok, because the struct is only ever instantiated once at the beginning of the program.
pub enum Command {
    /// Creates a new data folder and writes its settings.json.
    Init(InitOptions),

    /// Builds (or rebuilds) the index into a data folder from a source LAS/LAZ file.
    Build(BuildOptions),

    /// Runs a region/attribute query against a built index and prints matching points.
    Query(QueryOptions),
}

#[derive(Args, Debug)]
pub struct InitOptions {
    /// Data folder to create. Must not already contain a settings.json.
    pub data_dir: PathBuf,

    /// Randomize point order within a page before it is persisted.
    #[clap(long)]
    pub randomize_points: bool,

    /// Upgrade every point to LAS format version 1.4 during indexing.
    #[clap(long, default_value_t = true)]
    pub convert_to_version_1_4: bool,

    /// Preserve a source point's extra bytes beyond its format's fixed fields.
    #[clap(long)]
    pub copy_extra_bytes: bool,

    /// Maximum number of points a coarse (page-level) node may hold.
    #[clap(long, default_value_t = 50_000)]
    pub max_index_l1_size: u64,

    /// Maximum coarse octree depth.
    #[clap(long, default_value_t = 12)]
    pub max_index_l1_level: u32,

    /// Maximum number of points a fine, in-page node may hold.
    #[clap(long, default_value_t = 10_000)]
    pub max_index_l2_size: u64,

    /// Maximum fine, in-page octree depth.
    #[clap(long, default_value_t = 8)]
    pub max_index_l2_level: u32,

    /// Byte budget for the page cache.
    #[clap(long, default_value_t = 512 * 1024 * 1024)]
    pub cache_bytes: u64,
}

#[derive(Args, Debug)]
pub struct BuildOptions {
    /// Source LAS/LAZ file to index.
    pub input: PathBuf,

    /// Data folder previously created with `init`. A missing settings.json
    /// falls back to defaults rather than failing.
    pub data_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct QueryOptions {
    /// Data folder containing a previously built index.
    pub data_dir: PathBuf,

    #[clap(subcommand)]
    pub region: RegionArg,

    /// Stop after this many matches.
    #[clap(long)]
    pub maximum_results: Option<usize>,

    /// Restrict to points whose classification code is one of these.
    #[clap(long, value_delimiter = ',')]
    pub classification: Vec<u8>,
}

#[derive(Subcommand, Debug)]
pub enum RegionArg {
    /// Axis-aligned box, given as two opposite corners.
    Box {
        min_x: f64,
        min_y: f64,
        min_z: f64,
        max_x: f64,
        max_y: f64,
        max_z: f64,
    },
    /// Sphere, given as a center and a radius.
    Sphere {
        center_x: f64,
        center_y: f64,
        center_z: f64,
        radius: f64,
    },
}
