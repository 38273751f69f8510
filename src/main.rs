use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pbr_map_forge::client::{BlockingHttpTransport, GenerationClient};
use pbr_map_forge::dsl::{self, MaterialDocument};
use pbr_map_forge::graph::unpack_images;
use pbr_map_forge::orchestrator::{LogProgress, MaterialKey, Orchestrator};
use pbr_map_forge::protocol::{DEFAULT_ENDPOINT, DEFAULT_TIMEOUT_SECS};
use pbr_map_forge::resolver::{Resolution, resolve_base_texture};
use pbr_map_forge::schema;
use pbr_map_forge::settings::{
    CredentialStore, EnvCredentialStore, FilePicker, GenerationSettings, InMemoryCredentialStore,
    RfdFilePicker, parse_map_list,
};
use pbr_map_forge::temp_store::TempStore;
use pbr_map_forge::transport::{DEFAULT_MAX_BYTES, prepare_image};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate PBR maps for a material with the GenPBR API")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate maps for a material document and rebuild its graph
    Generate(GenerateArgs),
    /// Print the base texture detected in a material document
    Resolve {
        #[arg(long)]
        document: PathBuf,
    },
    /// Prepare an image for upload and report the result
    Prepare {
        #[arg(long)]
        image: PathBuf,
        #[arg(long, default_value_t = DEFAULT_MAX_BYTES)]
        max_bytes: usize,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Choose a base texture with the native file dialog
    Pick,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[arg(long)]
    document: PathBuf,
    /// Base texture; detected from the material when omitted
    #[arg(long)]
    image: Option<PathBuf>,
    /// Settings JSON; updated in place with the texture actually used
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Comma separated map kinds, or `all`
    #[arg(long)]
    maps: Option<String>,
    /// Falls back to $GENPBR_API_KEY
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    endpoint: String,
    /// Request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_BYTES)]
    max_bytes: usize,
    /// Where to write the updated document (defaults to overwriting --document)
    #[arg(long)]
    output: Option<PathBuf>,
    /// Write packed images out as files next to the document
    #[arg(long)]
    unpack_dir: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Generate(args) => generate(args),
        Command::Resolve { document } => resolve(&document),
        Command::Prepare {
            image,
            max_bytes,
            out,
        } => prepare(&image, max_bytes, out.as_deref()),
        Command::Pick => {
            match RfdFilePicker.pick_image() {
                Some(path) => println!("{}", path.display()),
                None => info!("no file selected"),
            }
            Ok(())
        }
    }
}

fn load_document(path: &Path) -> Result<MaterialDocument> {
    let doc = dsl::load_document_from_path(path)?;
    if let Err(e) = schema::validate_document(&doc) {
        warn!("{e:#}");
    }
    Ok(doc)
}

fn generate(args: GenerateArgs) -> Result<()> {
    let mut doc = load_document(&args.document)?;
    let mut settings = match &args.settings {
        Some(path) if path.exists() => GenerationSettings::load(path)?,
        _ => GenerationSettings::default(),
    };
    if let Some(image) = &args.image {
        settings.base_texture_path = image.display().to_string();
    }
    if let Some(maps) = &args.maps {
        settings.set_selection(&parse_map_list(maps)?);
    }

    let credentials: Box<dyn CredentialStore> = match args.api_key {
        Some(key) => Box::new(InMemoryCredentialStore::with_key(key)),
        None => Box::new(EnvCredentialStore::default()),
    };
    let transport = BlockingHttpTransport::new().context("failed to build HTTP client")?;
    let client = GenerationClient::new(Arc::new(transport))
        .with_endpoint(args.endpoint)
        .with_timeout(Duration::from_secs(args.timeout));
    let orchestrator = Orchestrator::new(client)?.with_max_bytes(args.max_bytes);
    let key = MaterialKey::for_document(&doc);

    let report = orchestrator
        .run(&key, &mut doc, &mut settings, credentials.as_ref(), &LogProgress)
        .map_err(|e| anyhow!("{}", e.user_message()))?;

    if let Some(dir) = &args.unpack_dir {
        let count = unpack_images(&mut doc, dir)?;
        info!(count, dir = %dir.display(), "unpacked images");
    }
    let output = args.output.as_deref().unwrap_or(&args.document);
    dsl::save_document_to_path(&doc, output)?;
    if let Some(path) = &args.settings {
        settings.save(path)?;
    }
    orchestrator.cleanup();

    let applied: Vec<&str> = report.apply.applied.iter().map(|k| k.as_str()).collect();
    println!("source: {}", report.source.display());
    println!("applied: {}", applied.join(","));
    for w in &report.apply.warnings {
        println!("warning: {}", w.message);
    }
    println!("written: {}", output.display());
    Ok(())
}

fn resolve(document: &Path) -> Result<()> {
    let doc = load_document(document)?;
    let temp = TempStore::new()?;
    match resolve_base_texture(&doc, &temp)? {
        Resolution::Found(img) if img.materialized => {
            println!("packed image '{}' (node {})", img.image_id, img.node_id);
        }
        Resolution::Found(img) => println!("{}", img.path.display()),
        Resolution::NotFound(reason) => {
            return Err(anyhow!("no base texture found: {reason:?}"));
        }
    }
    Ok(())
}

fn prepare(image: &Path, max_bytes: usize, out: Option<&Path>) -> Result<()> {
    let payload = prepare_image(image, max_bytes).map_err(|e| anyhow!("{}", e.user_message()))?;
    println!(
        "{} {} bytes (original {}, recompressed: {})",
        payload.mime_type,
        payload.len(),
        payload.original_size,
        payload.recompressed
    );
    if let Some(out) = out {
        std::fs::write(out, &payload.bytes)
            .with_context(|| format!("failed to write {}", out.display()))?;
    }
    Ok(())
}
