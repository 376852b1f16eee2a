use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use image::DynamicImage;
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tutu_contracts::config::{
    mask_secret, validate_credential, ConfigSnapshot, ConfigStore, DEFAULT_CONFIG_FILE,
};
use tutu_contracts::models::ModelCatalog;
use tutu_contracts::presets::{
    Preset, PresetLibrary, PresetOverrides, DEFAULT_CATEGORY, DEFAULT_PRESET_FILE,
};
use tutu_contracts::providers::{ProviderRouter, ProviderSelector};
use tutu_engine::{
    unavailable_output, GenerationEngine, GenerationRequest, NodeOutput, SamplingParams,
};

#[derive(Debug, Parser)]
#[command(
    name = "tutu-rs",
    version,
    about = "Gemini image generation through Comfly, OpenRouter and APICore"
)]
struct Cli {
    /// Configuration document holding the provider keys.
    #[arg(long = "config", global = true, env = "TUTU_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config_path: PathBuf,
    #[arg(long = "presets", global = true, env = "TUTU_PRESETS", default_value = DEFAULT_PRESET_FILE)]
    presets_path: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Models(ModelsArgs),
    #[command(subcommand)]
    Config(ConfigCommand),
    #[command(subcommand)]
    Presets(PresetsCommand),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    /// comfly, openrouter or apicore. Defaults to the configured provider.
    #[arg(long)]
    provider: Option<String>,
    /// Tagged model name, e.g. "[Comfly] gemini-2.5-flash-image-preview".
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    num_images: Option<u32>,
    #[arg(long)]
    temperature: Option<f64>,
    #[arg(long)]
    top_p: Option<f64>,
    /// Seconds.
    #[arg(long)]
    timeout: Option<u64>,
    /// Reference image; repeat for "image 2", "image 3" and so on.
    #[arg(long = "image")]
    images: Vec<PathBuf>,
    #[arg(long)]
    api_key: Option<String>,
    /// Send the request to this URL instead of the provider's own endpoint.
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    preset: Option<String>,
    #[arg(long, default_value = DEFAULT_CATEGORY)]
    category: String,
    /// Keep a partial streamed response when the read times out.
    #[arg(long)]
    accept_partial: bool,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct ModelsArgs {
    #[arg(long)]
    provider: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the configuration with keys masked.
    Show,
    SetKey { provider: String, key: String },
    Path,
}

#[derive(Debug, Subcommand)]
enum PresetsCommand {
    List {
        #[arg(long, default_value = DEFAULT_CATEGORY)]
        category: String,
    },
    /// Show by name or by id.
    Show {
        preset: String,
        #[arg(long, default_value = DEFAULT_CATEGORY)]
        category: String,
    },
    Save {
        name: String,
        /// JSON object, e.g. '{"provider":"openrouter","num_images":2}'.
        #[arg(long)]
        config: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = DEFAULT_CATEGORY)]
        category: String,
    },
    /// Update by id or by name; omitted fields stay as they are.
    Update {
        preset: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, default_value = DEFAULT_CATEGORY)]
        category: String,
    },
    /// Delete by id or by name.
    Delete {
        preset: String,
        #[arg(long, default_value = DEFAULT_CATEGORY)]
        category: String,
    },
}

const FAILURE_EXIT_CODE: i32 = 2;

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("tutu-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args, &cli.config_path, &cli.presets_path),
        Command::Models(args) => run_models(args),
        Command::Config(command) => run_config(command, &cli.config_path),
        Command::Presets(command) => run_presets(command, &cli.presets_path),
    }
}

fn run_generate(args: GenerateArgs, config_path: &Path, presets_path: &Path) -> Result<i32> {
    let snapshot = ConfigSnapshot::load(ConfigStore::new(config_path));
    let overrides = match args.preset.as_deref() {
        Some(name) => {
            let library = PresetLibrary::load(presets_path);
            let preset = library
                .get_by_name(&args.category, name)
                .with_context(|| format!("preset '{name}' not found in '{}'", args.category))?;
            info!(preset = %preset.name, "applying preset");
            PresetOverrides::from_config(&preset.config)
        }
        None => PresetOverrides::default(),
    };
    let mut request = build_request(&args, &overrides, snapshot.document().default_provider())?;
    request.reference_images = load_reference_images(&args.images)?;
    let router = build_router(request.provider, args.endpoint.as_deref());

    let output = match GenerationEngine::new(Box::new(snapshot)) {
        Ok(engine) => engine.with_router(router).process(&request),
        Err(err) => unavailable_output(&request, &err),
    };
    for warning in &output.warnings {
        eprintln!("warning: {warning}");
    }
    let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let written = write_outputs(&args.out, &output, &stamp)?;
    info!(files = written.len(), out = %args.out.display(), "outputs written");

    match output.failure {
        Some(kind) => {
            eprintln!("generation failed ({kind})\n\n{}", output.transcript);
            Ok(FAILURE_EXIT_CODE)
        }
        None => {
            println!("{}", output.primary_image_url);
            Ok(0)
        }
    }
}

/// Explicit flags win over preset values, which win over defaults.
fn build_request(
    args: &GenerateArgs,
    overrides: &PresetOverrides,
    configured_provider: Option<ProviderSelector>,
) -> Result<GenerationRequest> {
    let provider = match args.provider.as_deref().or(overrides.provider.as_deref()) {
        Some(raw) => parse_provider(raw)?,
        None => configured_provider.unwrap_or(ProviderSelector::Comfly),
    };
    let model = args
        .model
        .clone()
        .or_else(|| overrides.model.clone())
        .unwrap_or_default();
    let defaults = SamplingParams::default();

    let mut request = GenerationRequest::new(overrides.render_prompt(&args.prompt), provider, model);
    request.sample_count = args.num_images.or(overrides.num_images).unwrap_or(1);
    request.sampling = SamplingParams {
        temperature: args
            .temperature
            .or(overrides.temperature)
            .unwrap_or(defaults.temperature),
        top_p: args.top_p.or(overrides.top_p).unwrap_or(defaults.top_p),
    };
    if let Some(timeout) = args.timeout.or(overrides.timeout) {
        request.timeout_seconds = timeout;
    }
    request.api_key_override = args.api_key.clone();
    request.accept_partial_on_timeout = args.accept_partial;
    Ok(request)
}

fn build_router(provider: ProviderSelector, endpoint: Option<&str>) -> ProviderRouter {
    let router = ProviderRouter::new();
    match endpoint.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => {
            info!(provider = %provider, endpoint = url, "using custom endpoint");
            let profile = router.profile(provider).with_endpoint(url);
            router.with_profile(profile)
        }
        None => router,
    }
}

fn parse_provider(raw: &str) -> Result<ProviderSelector> {
    raw.parse::<ProviderSelector>().map_err(anyhow::Error::msg)
}

fn load_reference_images(paths: &[PathBuf]) -> Result<Vec<DynamicImage>> {
    paths
        .iter()
        .map(|path| {
            image::open(path)
                .with_context(|| format!("failed to read reference image {}", path.display()))
        })
        .collect()
}

fn write_outputs(out_dir: &Path, output: &NodeOutput, stamp: &str) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let mut written = Vec::with_capacity(output.images.len() + 1);
    for (idx, image) in output.images.iter().enumerate() {
        let path = out_dir.join(format!("image-{stamp}-{:02}.png", idx + 1));
        image
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        written.push(path);
    }
    let transcript_path = out_dir.join("transcript.md");
    fs::write(&transcript_path, &output.transcript)
        .with_context(|| format!("failed to write {}", transcript_path.display()))?;
    written.push(transcript_path);
    Ok(written)
}

fn run_models(args: ModelsArgs) -> Result<i32> {
    let provider = args.provider.as_deref().map(parse_provider).transpose()?;
    let catalog = ModelCatalog::new(None);
    for spec in catalog
        .list()
        .filter(|spec| provider.map_or(true, |provider| spec.provider == provider))
    {
        match spec.note.as_deref() {
            Some(note) => println!("{}  ({note})", spec.name),
            None => println!("{}", spec.name),
        }
    }
    Ok(0)
}

fn run_config(command: ConfigCommand, config_path: &Path) -> Result<i32> {
    let mut snapshot = ConfigSnapshot::load(ConfigStore::new(config_path));
    info!(
        path = %snapshot.store().path().display(),
        loaded_at = %snapshot.loaded_at().to_rfc3339(),
        "configuration loaded"
    );
    match command {
        ConfigCommand::Show => {
            println!(
                "{}",
                serde_json::to_string_pretty(&Value::Object(snapshot.document().redacted()))?
            );
        }
        ConfigCommand::SetKey { provider, key } => {
            let provider = parse_provider(&provider)?;
            if let Err(issue) = validate_credential(provider, &key) {
                warn!(provider = %provider, "storing a key that will be rejected: {issue}");
            }
            let mut document = snapshot.document().clone();
            document.set_credential(provider, &key);
            snapshot.store().save(&document)?;
            snapshot.refresh();
            println!(
                "Stored {} as {} in {}",
                mask_secret(snapshot.document().raw_credential(provider)),
                provider.credential_field(),
                snapshot.store().path().display()
            );
        }
        ConfigCommand::Path => println!("{}", snapshot.store().path().display()),
    }
    Ok(0)
}

fn run_presets(command: PresetsCommand, presets_path: &Path) -> Result<i32> {
    let mut library = PresetLibrary::load(presets_path);
    match command {
        PresetsCommand::List { category } => {
            for preset in library.list(&category) {
                if preset.description.is_empty() {
                    println!("{}  {}", preset.id, preset.name);
                } else {
                    println!("{}  {}  - {}", preset.id, preset.name, preset.description);
                }
            }
        }
        PresetsCommand::Show { preset, category } => {
            let found = find_preset(&library, &category, &preset)
                .with_context(|| format!("preset '{preset}' not found in '{category}'"))?;
            println!("{}", serde_json::to_string_pretty(&found)?);
        }
        PresetsCommand::Save {
            name,
            config,
            description,
            category,
        } => {
            let config = parse_preset_config(&config)?;
            let id = library.save_preset(&category, &name, config, &description)?;
            println!("{id}");
        }
        PresetsCommand::Update {
            preset,
            name,
            config,
            description,
            category,
        } => {
            let id = find_preset(&library, &category, &preset)
                .map(|found| found.id)
                .with_context(|| format!("preset '{preset}' not found in '{category}'"))?;
            let config = config.as_deref().map(parse_preset_config).transpose()?;
            if !library.update_preset(&category, &id, config, name.as_deref(), description.as_deref())? {
                bail!("preset '{id}' not found in '{category}'");
            }
            println!("Updated {id}");
        }
        PresetsCommand::Delete { preset, category } => {
            let id = find_preset(&library, &category, &preset)
                .map(|found| found.id)
                .unwrap_or(preset);
            if !library.delete_preset(&category, &id)? {
                bail!("preset '{id}' not found in '{category}'");
            }
            println!("Deleted {id}");
        }
    }
    Ok(0)
}

fn find_preset(library: &PresetLibrary, category: &str, name_or_id: &str) -> Option<Preset> {
    library
        .get_by_name(category, name_or_id)
        .or_else(|| library.get_by_id(category, name_or_id))
}

fn parse_preset_config(raw: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(raw).context("preset config is not valid JSON")?;
    match value {
        Value::Object(object) => Ok(object),
        _ => bail!("preset config must be a JSON object"),
    }
}
