use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use pakloader::fetch::{CacheLayout, ConditionalFetcher, FetchEvent, ReqwestClient};
use pakloader::level_streaming::{StreamingWorld, WorldType};
use pakloader::platform::{self, Platform};
use pakloader::streamable::LoadMode;
use pakloader::{Config, PakLoader, logging};

#[derive(Parser, Debug)]
struct ActionList {
    #[arg(index = 1)]
    pak: PathBuf,
    /// Only list files with this extension
    #[arg(short, long, default_value = "")]
    extension: String,
}

#[derive(Parser, Debug)]
struct ActionLevels {
    #[arg(index = 1)]
    pak: PathBuf,
}

#[derive(Parser, Debug)]
struct ActionAssets {
    #[arg(index = 1)]
    pak: PathBuf,
    /// Resolve in batches from the tick loop instead of inline
    #[arg(long = "async", default_value = "false")]
    async_load: bool,
}

#[derive(Parser, Debug)]
struct ActionFetch {
    #[arg(index = 1)]
    url: String,
    /// Only report whether the server has different content
    #[arg(long, default_value = "false")]
    check_only: bool,
    /// Cache under DownloadedFiles instead of DownloadedPaks
    #[arg(long, default_value = "false")]
    files: bool,
}

#[derive(Parser, Debug)]
struct ActionPlatform {
    /// Report as if running in a play-in-editor world
    #[arg(long, default_value = "false")]
    pie: bool,
    #[arg(long)]
    platform: Option<Platform>,
}

#[derive(Parser, Debug)]
enum Action {
    /// List logical references of every file in a pak
    List(ActionList),
    /// List maps in a pak
    Levels(ActionLevels),
    /// Load and classify the assets of a pak
    Assets(ActionAssets),
    /// Download a pak (or any file) into the ETag cache
    Fetch(ActionFetch),
    /// Print cooked platform names
    Platform(ActionPlatform),
}

#[derive(Parser, Debug)]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Directory logical paths resolve against
    #[arg(long)]
    root: Option<PathBuf>,
    /// Logical content directory paks are mounted on
    #[arg(long)]
    content_dir: Option<String>,
    #[arg(short, long)]
    aes: Option<String>,
    #[arg(short, long, default_value = "false")]
    verbose: bool,
    #[arg(long, default_value = "false")]
    debug: bool,
    #[command(subcommand)]
    action: Action,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_logging(args.verbose, args.debug)?;

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(root) = args.root {
        config.root_dir = root;
    }
    if let Some(content_dir) = args.content_dir {
        config.content_dir = content_dir;
    }
    if let Some(aes) = args.aes {
        config.aes_key = Some(aes);
    }
    config.aes_key().context("--aes")?;

    match args.action {
        Action::List(action) => action_list(action, &config),
        Action::Levels(action) => action_levels(action, &config),
        Action::Assets(action) => action_assets(action, &config),
        Action::Fetch(action) => action_fetch(action, &config),
        Action::Platform(action) => action_platform(action, &config),
    }
}

fn action_list(args: ActionList, config: &Config) -> Result<()> {
    let mut loader = PakLoader::from_config(config)?;
    let references = loader
        .asset_references_from_pak(&args.pak, &args.extension)
        .with_context(|| format!("failed to read {}", args.pak.display()))?;
    for reference in references {
        println!("{reference}");
    }
    Ok(())
}

fn action_levels(args: ActionLevels, config: &Config) -> Result<()> {
    let mut loader = PakLoader::from_config(config)?;
    let levels = loader.levels_from_pak(&args.pak).with_context(|| format!("failed to read {}", args.pak.display()))?;
    for level in levels {
        println!("{level}");
    }
    Ok(())
}

fn action_assets(args: ActionAssets, config: &Config) -> Result<()> {
    let mode = if args.async_load { LoadMode::Async } else { config.load_mode };
    let mut loader = PakLoader::from_config(config)?.with_load_mode(mode);

    let (tx, rx) = std::sync::mpsc::channel();
    loader
        .load_assets_from(
            &args.pak,
            Box::new(move |assets| {
                tx.send(assets).ok();
            }),
        )
        .with_context(|| format!("failed to read {}", args.pak.display()))?;
    while loader.has_pending_loads() {
        loader.tick();
    }
    let assets = rx.recv().context("load request was dropped")?;

    for class in &assets.classes {
        println!("class  {}", class.path());
    }
    for object in &assets.objects {
        println!("object {}", object.path());
    }
    for skipped in &assets.skipped {
        println!("skip   {skipped}");
    }
    Ok(())
}

fn action_fetch(args: ActionFetch, config: &Config) -> Result<()> {
    let layout = if args.files {
        CacheLayout::files(&config.saved_dir)
    } else {
        CacheLayout::paks(&config.saved_dir)
    };
    let fetcher = ConditionalFetcher::new(Arc::new(ReqwestClient::new()?), layout);

    let mut failed = None;
    for event in fetcher.start(&args.url, args.check_only).wait() {
        match event {
            FetchEvent::Updated(url) => println!("updated {url}"),
            FetchEvent::Succeeded(path) => println!("{}", path.display()),
            FetchEvent::Failed(reason) => failed = Some(reason),
        }
    }
    if let Some(reason) = failed {
        bail!("{reason}: {}", args.url);
    }
    Ok(())
}

fn action_platform(args: ActionPlatform, config: &Config) -> Result<()> {
    let world = StreamingWorld::new(if args.pie { WorldType::Pie } else { WorldType::Game });
    let name = platform::cooked_platform_name_for(&world, args.platform.unwrap_or_else(Platform::host), &config.engine_version);
    println!("{name}");

    let cooked = platform::cooked_platform_names(&world, config);
    println!("engine version: {}", cooked.engine_version);
    for platform in cooked.platforms {
        println!("  {platform}");
    }
    Ok(())
}
