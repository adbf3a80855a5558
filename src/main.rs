//! diabretina - lesion segmentation and quantification for fundus photographs.
//!
//! This binary starts the HTTP API, analyzes single files, or checks a checkpoint.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use diabretina::{
    analysis::{AnalysisService, FsArtifactStore, ResultCache},
    config::{
        AnalyzeConfig, AnalyzeOutputFormat, CheckConfig, Cli, Command, ModelOptions, ServeConfig,
    },
    inference::{select_device, InferenceEngine, Segmenter},
    model::Checkpoint,
    narrative::ChatCompletionClient,
    preprocess::ModelTensor,
    quantify::LesionType,
    server::{create_router, AppState, RouterConfig},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Serve(config) => run_serve(config).await,
        Command::Analyze(config) => run_analyze(config).await,
        Command::Check(config) => run_check(config),
    }
}

// =============================================================================
// Serve Command
// =============================================================================

async fn run_serve(config: ServeConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    print_banner();

    info!("Configuration:");
    info!("  Weights: {}", config.model.weights.display());
    info!("  Image size: {}", config.model.image_size);
    info!(
        "  Counting: min area {}px, {:?} connectivity",
        config.pipeline.min_lesion_area, config.pipeline.connectivity
    );
    info!("  Max concurrent analyses: {}", config.max_concurrent);
    if config.cache_bytes > 0 {
        info!("  Result cache: {}MB", config.cache_bytes / (1024 * 1024));
    } else {
        info!("  Result cache: disabled");
    }

    let engine = match load_engine(&config.model) {
        Ok(engine) => engine,
        Err(code) => return code,
    };

    let service = AnalysisService::new(Arc::new(engine))
        .with_quantifier(config.pipeline.quantifier())
        .with_clahe(config.pipeline.clahe())
        .with_encoder(config.pipeline.encoder());

    let mut state = AppState::new(service).with_max_concurrent(config.max_concurrent);

    if config.cache_bytes > 0 {
        state = state.with_cache(ResultCache::with_capacity(config.cache_bytes));
    }

    match &config.output_dir {
        Some(dir) => {
            let store = FsArtifactStore::new(dir);
            if let Err(e) = store.ensure_dirs().await {
                error!("Cannot prepare output directory: {}", e);
                return ExitCode::FAILURE;
            }
            info!("  Output directory: {}", dir.display());
            state = state.with_store(Arc::new(store));
        }
        None => info!("  Output directory: none (results are not persisted)"),
    }

    match config.narrative_config() {
        Some(narrative) => match ChatCompletionClient::new(narrative) {
            Ok(client) => {
                info!("  Narrative endpoint: {}", client.config().endpoint);
                state = state.with_narrative(Arc::new(client));
            }
            Err(e) => {
                error!("Cannot build narrative client: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => {
            warn!("  Narrative endpoint: not configured");
            warn!("        /diagnosis will return a placeholder text");
        }
    }

    let router = create_router(state, build_router_config(&config));

    let addr = config.bind_address();

    info!("");
    info!("────────────────────────────────────────────────────────────────");
    info!("  Server listening on: http://{}", addr);
    info!("");
    info!("  Try these endpoints:");
    info!("    curl http://{}/health", addr);
    info!("    curl http://{}/lesions", addr);
    info!("    curl -F file=@fundus.jpg http://{}/predict", addr);
    info!("────────────────────────────────────────────────────────────────");
    info!("");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = axum::serve(listener, router).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Print the startup banner.
fn print_banner() {
    let version = env!("CARGO_PKG_VERSION");
    info!("");
    info!("██████╗ ██╗ █████╗ ██████╗ ██████╗ ███████╗████████╗██╗███╗   ██╗ █████╗ ");
    info!("██╔══██╗██║██╔══██╗██╔══██╗██╔══██╗██╔════╝╚══██╔══╝██║████╗  ██║██╔══██╗");
    info!("██║  ██║██║███████║██████╔╝██████╔╝█████╗     ██║   ██║██╔██╗ ██║███████║");
    info!("██║  ██║██║██╔══██║██╔══██╗██╔══██╗██╔══╝     ██║   ██║██║╚██╗██║██╔══██║");
    info!("██████╔╝██║██║  ██║██████╔╝██║  ██║███████╗   ██║   ██║██║ ╚████║██║  ██║");
    info!("╚═════╝ ╚═╝╚═╝  ╚═╝╚═════╝ ╚═╝  ╚═╝╚══════╝   ╚═╝   ╚═╝╚═╝  ╚═══╝╚═╝  ╚═╝");
    info!("");
    info!("                                v{}", version);
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "diabretina=debug,tower_http=debug"
    } else {
        "diabretina=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build RouterConfig from the application ServeConfig.
fn build_router_config(config: &ServeConfig) -> RouterConfig {
    let mut router_config = RouterConfig::new().with_max_upload_bytes(config.max_upload_bytes);

    if let Some(ref origins) = config.cors_origins {
        router_config = router_config.with_cors_origins(origins.clone());
    }

    router_config.with_tracing(!config.no_tracing)
}

/// Select the device and load the checkpoint, logging failures.
fn load_engine(model: &ModelOptions) -> Result<InferenceEngine, ExitCode> {
    let weights = &model.weights;
    let device = select_device(model.cpu).map_err(|e| {
        error!("Cannot select compute device: {}", e);
        ExitCode::FAILURE
    })?;

    InferenceEngine::load(weights, model.network_config(), device).map_err(|e| {
        error!("Failed to load model: {}", e);
        error!("");
        error!("  Please check:");
        error!("    - The file '{}' exists and is readable", weights.display());
        error!("    - It is a safetensors file or a PyTorch checkpoint with a state_dict");
        error!("    - --image-size matches the size the network was trained with");
        ExitCode::FAILURE
    })
}

// =============================================================================
// Analyze Command
// =============================================================================

async fn run_analyze(config: AnalyzeConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let bytes = match tokio::fs::read(&config.input).await {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error: cannot read {}: {}", config.input.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let engine = match load_engine(&config.model) {
        Ok(engine) => engine,
        Err(code) => return code,
    };

    let service = AnalysisService::new(Arc::new(engine))
        .with_quantifier(config.pipeline.quantifier())
        .with_clahe(config.pipeline.clahe())
        .with_encoder(config.pipeline.encoder());

    let start = Instant::now();
    let output = match tokio::task::spawn_blocking(move || service.analyze_bytes(&bytes)).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("Error: analysis task failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(elapsed_ms = start.elapsed().as_millis() as u64, "Analyzed {}", config.input.display());

    if let Some(ref dir) = config.output_dir {
        let stem = config.output_stem();
        let writes = [
            (dir.join(format!("{}-preprocessed.jpg", stem)), &output.preprocessed_jpeg),
            (dir.join(format!("{}-predicted.jpg", stem)), &output.overlay_jpeg),
        ];
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            eprintln!("Error: cannot create {}: {}", dir.display(), e);
            return ExitCode::FAILURE;
        }
        for (path, data) in writes {
            if let Err(e) = tokio::fs::write(&path, data).await {
                eprintln!("Error: cannot write {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
            info!("Wrote {}", path.display());
        }
    }

    match config.format {
        AnalyzeOutputFormat::Text => {
            for lesion in LesionType::ALL {
                println!("{:<24} {}", lesion.label(), output.counts.get(lesion));
            }
            println!("{:<24} {}", "Total", output.counts.total());
        }
        AnalyzeOutputFormat::Json => match serde_json::to_string_pretty(&output.counts) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        },
    }

    ExitCode::SUCCESS
}

// =============================================================================
// Check Command
// =============================================================================

fn run_check(config: CheckConfig) -> ExitCode {
    if config.verbose {
        init_logging(true);
    }

    println!("diabretina Checkpoint Check");
    println!("═══════════════════════════");
    println!();

    if let Err(e) = config.validate() {
        println!("✗ Configuration: {}", e);
        return ExitCode::FAILURE;
    }

    let weights = &config.model.weights;
    let checkpoint = match Checkpoint::load(weights) {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            println!("✗ Checkpoint: {}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("✓ Checkpoint: {}", weights.display());
    println!("  Format: {:?}", checkpoint.format());
    println!("  SHA-256: {}", checkpoint.digest());
    println!(
        "  Tensors: {} ({} parameters)",
        checkpoint.len(),
        checkpoint.parameter_count()
    );

    let device = match select_device(config.model.cpu) {
        Ok(device) => device,
        Err(e) => {
            println!("✗ Device: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let digest = checkpoint.digest().to_string();
    let net = match checkpoint.build_network(config.model.network_config(), &device) {
        Ok(net) => net,
        Err(e) => {
            println!("✗ Network: {}", e);
            println!();
            println!("Please check:");
            println!("  - The checkpoint was trained with this network layout");
            println!("  - --image-size matches the training input size");
            return ExitCode::FAILURE;
        }
    };
    println!("✓ Network: all parameters bound");

    let engine = InferenceEngine::new(net, device).with_digest(digest);
    println!("  Device: {}", engine.device_label());

    if config.warmup {
        let size = engine.input_size();
        let Some(blank) = ModelTensor::from_nchw(vec![0.0; 3 * size * size], size, size) else {
            println!("✗ Warm-up: cannot build input tensor");
            return ExitCode::FAILURE;
        };

        print!("Running warm-up pass... ");
        let start = Instant::now();
        match engine.segment(&blank) {
            Ok(map) => println!(
                "✓ {}x{}x{} in {}ms",
                map.height(),
                map.width(),
                map.classes(),
                start.elapsed().as_millis()
            ),
            Err(e) => {
                println!("✗ failed");
                println!();
                println!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    println!();
    println!("Checkpoint is ready to serve.");
    ExitCode::SUCCESS
}
