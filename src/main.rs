use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use tile_smith::builder::DatasetBuilder;
use tile_smith::osm::OsmSource;
use tile_smith::store::FeatureStore;
use tile_smith::{Config, RenderResult, TileAddress, TileEngine, TileSource};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the feature store from an OpenStreetMap extract (.osm.pbf)
    Build { extract: PathBuf },
    /// Render one tile as JPEG
    Render {
        zoom: u8,
        x: u32,
        y: u32,
        /// Write the image here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// List the features selected for one tile, in draw order
    Query { zoom: u8, x: u32, y: u32 },
}

#[tokio::main]
async fn main() -> tile_smith::Result<()> {
    let _ = tracing_subscriber::fmt::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive("info".parse().expect("invalid filter"))
                .from_env_lossy(),
        )
        .try_init();

    let args = Cli::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match args.command {
        Command::Build { extract } => build(&config, extract).await,
        Command::Render { zoom, x, y, out } => {
            render(&config, TileAddress::new(zoom, x, y), out).await
        }
        Command::Query { zoom, x, y } => query(&config, TileAddress::new(zoom, x, y)).await,
    }
}

async fn build(config: &Config, extract: PathBuf) -> tile_smith::Result<()> {
    if !extract.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("extract {:?} does not exist", extract),
        )
        .into());
    }

    info!(database = ?config.database, "building feature store, large extracts can take hours");
    let store = FeatureStore::create(&config.database).await?;
    let summary = DatasetBuilder::new(store.clone(), &config.builder)
        .ingest_all(OsmSource::new(&extract).features())
        .await?;
    store.close().await;

    info!(stored = summary.stored, "finished");
    Ok(())
}

async fn render(config: &Config, address: TileAddress, out: Option<PathBuf>) -> tile_smith::Result<()> {
    let engine = TileEngine::open(config).await?;
    let result = engine.render_tile(address).await;
    engine.shutdown().await?;

    match result? {
        RenderResult::Cached(tile) => println!("{}", tile.path.display()),
        RenderResult::Rendered(raster) => {
            let bytes = raster.encode_jpeg(config.cache.jpeg_quality)?;
            match out {
                Some(path) => fs::write(path, bytes)?,
                None => io::stdout().write_all(&bytes)?,
            }
        }
    }

    Ok(())
}

async fn query(config: &Config, address: TileAddress) -> tile_smith::Result<()> {
    let store = FeatureStore::open(&config.database).await?;
    let features = store
        .query(&address.bounds(), address.zoom, config.render.query_limit)
        .await?;

    for feature in features {
        println!(
            "{}\t{:.6}\t{}",
            feature.id,
            feature.bounds.area(),
            serde_json::to_string(&feature.tags)?
        );
    }

    store.close().await;
    Ok(())
}
