//! Slide alignment tool
//!
//! Subcommands:
//! - `align`: interactive alignment against the microscope server
//! - `tiles`: lay out an acquisition tile grid over a bounding box
//! - `transform-tiles`: rewrite TileConfiguration files into stage coordinates
//! - `presets`: list, show or delete saved transforms
//! - `green-box`: find the scan-area box in a macro image
//! - `heartbeat`: supervise or emulate a heartbeat helper

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use image::{Rgb, RgbImage};
use ndarray::Array3;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use slide_align::green_box::{debug_overlay, green_mask};
use slide_align::heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT};
use slide_align::presets::{save_slide_alignment, validate_transform};
use slide_align::tiling::tile_bounding_box;
use slide_align::{
    detect_green_box, green_box_transform, run_heartbeat_client, transform_tile_configuration,
    AlignmentConfig, AlignmentExecutor, AlignmentSession, ConfirmationGate, ConfirmationPrompt,
    GateDecision, GreenBoxParams, HeartbeatServer, StageBounds, Tile, TileGridParams,
    TransformPreset, TransformPresetStore,
};
use stage_hardware::{MicroscopeSocketClient, MockStage, SocketConfig, StageInterface};
use stage_math::AffineTransform2D;
use tokio::sync::watch;
use tracing::{info, warn};

/// Slide-to-stage alignment for scanning microscopes
#[derive(Parser, Debug)]
#[command(name = "slide_align")]
#[command(about = "Align slide image coordinates to microscope stage coordinates")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an interactive alignment
    Align(AlignArgs),

    /// Lay out a serpentine tile grid over an image bounding box
    Tiles {
        /// Acquisition directory; the grid goes to its `bounds` subdirectory
        #[arg(long)]
        output: PathBuf,

        #[arg(
            long,
            num_args = 4,
            allow_hyphen_values = true,
            value_names = ["X1", "Y1", "X2", "Y2"],
            help = "Opposite corners of the box in image pixels"
        )]
        bounds: Vec<f64>,

        #[command(flatten)]
        grid: TileGridParams,

        /// Also write the tiles as JSON, usable as `align --tiles`
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Rewrite TileConfiguration.txt files into stage coordinates
    TransformTiles {
        /// Directory whose subdirectories hold TileConfiguration.txt
        #[arg(long)]
        dir: PathBuf,

        #[command(flatten)]
        source: TransformSource,

        /// Directory holding saved_transforms.json
        #[arg(long, default_value = ".")]
        config_dir: PathBuf,
    },

    /// Manage saved transform presets
    Presets {
        /// Directory holding saved_transforms.json
        #[arg(long, default_value = ".")]
        config_dir: PathBuf,

        #[command(subcommand)]
        command: PresetCommand,
    },

    /// Detect the green scan-area box in a macro image
    GreenBox {
        /// Macro image file
        #[arg(long)]
        image: PathBuf,

        /// JSON file with detection parameters
        #[arg(long)]
        params: Option<PathBuf>,

        /// Full-resolution image width, for the macro-to-main transform
        #[arg(long, requires = "main_height")]
        main_width: Option<usize>,

        /// Full-resolution image height
        #[arg(long, requires = "main_width")]
        main_height: Option<usize>,

        /// Write the mask and detected box over the macro image here
        #[arg(long)]
        debug_output: Option<PathBuf>,
    },

    /// Heartbeat supervision
    Heartbeat {
        #[command(subcommand)]
        command: HeartbeatCommand,
    },
}

#[derive(clap::Args, Debug)]
struct AlignArgs {
    #[arg(
        long,
        help = "JSON file with the tiles to align against",
        long_help = "JSON array of tiles, each with a name and an image-space centroid, \
            e.g. [{\"name\": \"0001\", \"centroid\": [1024.0, 2048.0]}]"
    )]
    tiles: PathBuf,

    #[arg(
        long,
        help = "Load alignment settings from a JSON file",
        long_help = "Load alignment settings from a JSON file instead of the command line \
            flags. Missing fields take their defaults."
    )]
    config: Option<PathBuf>,

    #[arg(long, help = "Use an in-memory stage instead of the microscope server")]
    dry_run: bool,

    #[command(flatten)]
    alignment: AlignmentConfig,

    #[command(flatten)]
    socket: SocketConfig,

    #[arg(long, help = "Save the result as a transform preset with this name")]
    save_preset: Option<String>,

    #[arg(long, default_value = ".", help = "Directory holding saved_transforms.json")]
    config_dir: PathBuf,

    #[arg(long, default_value = "default", help = "Microscope the preset belongs to")]
    microscope: String,

    #[arg(long, default_value = "default", help = "Slide mounting method of the preset")]
    mounting_method: String,

    #[arg(long, default_value = "", help = "Free-form preset notes")]
    notes: String,

    #[arg(
        long,
        requires = "sample",
        help = "Project directory for the per-sample alignment file"
    )]
    project_dir: Option<PathBuf>,

    #[arg(long, requires = "project_dir", help = "Sample name for the alignment file")]
    sample: Option<String>,

    #[arg(long, default_value = "brightfield", help = "Imaging modality")]
    modality: String,

    #[arg(
        long,
        num_args = 4,
        value_names = ["X_MIN", "X_MAX", "Y_MIN", "Y_MAX"],
        help = "Stage limits in µm for checking the result",
        long_help = "Stage travel limits in µm. With --image-size, the result is checked \
            by mapping the image corners and center onto the stage."
    )]
    stage_bounds: Option<Vec<f64>>,

    #[arg(long, num_args = 2, value_names = ["WIDTH", "HEIGHT"], requires = "stage_bounds")]
    image_size: Option<Vec<f64>>,
}

/// Where `transform-tiles` gets its transform
#[derive(clap::Args, Debug)]
#[group(required = true, multiple = false)]
struct TransformSource {
    /// Saved preset name
    #[arg(long)]
    preset: Option<String>,

    /// Explicit coefficients m00,m10,m01,m11,m02,m12
    #[arg(long, value_delimiter = ',', num_args = 6)]
    coefficients: Option<Vec<f64>>,
}

#[derive(Subcommand, Debug)]
enum PresetCommand {
    /// List presets
    List {
        /// Only presets for this microscope
        #[arg(long)]
        microscope: Option<String>,
    },
    /// Print one preset as JSON
    Show { name: String },
    /// Delete a preset
    Delete { name: String },
}

#[derive(Subcommand, Debug)]
enum HeartbeatCommand {
    /// Wait for a helper to connect and watch its heartbeats
    Serve {
        #[arg(long, default_value = "127.0.0.1:0")]
        bind: String,

        /// Seconds of silence before the helper is considered dead
        #[arg(long, default_value_t = DEFAULT_HEARTBEAT_TIMEOUT.as_secs())]
        timeout_secs: u64,
    },
    /// Send heartbeats to a supervising workflow
    Send {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long)]
        port: u16,

        /// Seconds between heartbeats
        #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL.as_secs())]
        interval_secs: u64,
    },
}

/// Operator prompts on the terminal
struct TerminalGate {
    editor: DefaultEditor,
}

impl TerminalGate {
    fn new() -> Result<Self> {
        Ok(Self {
            editor: DefaultEditor::new()?,
        })
    }

    /// `None` on Ctrl-C, Ctrl-D or a read error
    fn read_line(&mut self, prompt: &str) -> Option<String> {
        match self.editor.readline(prompt) {
            Ok(line) => Some(line.trim().to_string()),
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                None
            }
            Err(ReadlineError::Eof) => None,
            Err(err) => {
                println!("Error: {err}");
                None
            }
        }
    }
}

impl ConfirmationGate for TerminalGate {
    fn select_reference(&mut self, tiles: &[Tile]) -> Option<Tile> {
        println!("Tiles:");
        for (i, tile) in tiles.iter().enumerate() {
            println!(
                "  [{i}] {} ({:.1}, {:.1})",
                tile.name, tile.centroid.x, tile.centroid.y
            );
        }

        loop {
            let line = self.read_line("Reference tile number or name ('q' to cancel): ")?;
            if line.eq_ignore_ascii_case("q") {
                return None;
            }

            let found = match line.parse::<usize>() {
                Ok(i) => tiles.get(i),
                Err(_) => tiles.iter().find(|t| t.name == line),
            };
            match found {
                Some(tile) => return Some(tile.clone()),
                None => println!("No tile '{line}'"),
            }
        }
    }

    fn confirm_position(&mut self, prompt: &ConfirmationPrompt) -> GateDecision {
        println!();
        println!(
            "Step {}/{}: tile '{}' at image ({:.1}, {:.1})",
            prompt.step,
            prompt.total_steps,
            prompt.tile.name,
            prompt.tile.centroid.x,
            prompt.tile.centroid.y
        );
        println!(
            "Stage moved to predicted position ({:.2}, {:.2})",
            prompt.predicted.x, prompt.predicted.y
        );
        if prompt.is_reference() {
            println!("Center the stage on the tile using the microscope controls.");
        }

        loop {
            let Some(line) = self.read_line("Enter to accept current position, 'c' to cancel: ")
            else {
                return GateDecision::Cancel;
            };
            match line.as_str() {
                "" | "y" | "yes" => return GateDecision::Accept,
                "c" | "cancel" | "q" => return GateDecision::Cancel,
                other => println!("Unrecognized answer '{other}'"),
            }
        }
    }
}

fn load_tiles(path: &Path) -> Result<Vec<Tile>> {
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("opening tiles file {}", path.display()))?,
    );
    let tiles: Vec<Tile> = serde_json::from_reader(reader)
        .with_context(|| format!("parsing tiles file {}", path.display()))?;
    info!("Loaded {} tiles from {}", tiles.len(), path.display());
    Ok(tiles)
}

fn run_alignment<S: StageInterface>(
    stage: S,
    session: AlignmentSession,
) -> Result<Option<AffineTransform2D>> {
    let mut gate = TerminalGate::new()?;
    let mut executor = AlignmentExecutor::new(stage, &mut gate, session);
    Ok(executor.run()?)
}

fn cmd_align(args: AlignArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => AlignmentConfig::load(path)?,
        None => {
            args.alignment.validate()?;
            args.alignment.clone()
        }
    };
    let tiles = load_tiles(&args.tiles)?;
    let session = AlignmentSession::new(config, tiles)?;

    let result = if args.dry_run {
        info!("Dry run: using in-memory stage");
        run_alignment(MockStage::new(), session)?
    } else {
        info!("Connecting to microscope server at {}", args.socket.address());
        let client = MicroscopeSocketClient::connect(args.socket.clone())?;
        run_alignment(client, session)?
    };

    let Some(transform) = result else {
        println!("Alignment cancelled");
        return Ok(());
    };
    println!("Alignment complete: {transform}");
    println!("Coefficients: {:?}", transform.coefficients());

    if let (Some(bounds), Some(size)) = (&args.stage_bounds, &args.image_size) {
        let bounds = StageBounds::new(bounds[0], bounds[1], bounds[2], bounds[3]);
        if let Err(e) = validate_transform(&transform, size[0], size[1], &bounds) {
            warn!("{e}");
            println!("Warning: {e}");
        }
    }

    if let Some(name) = args.save_preset {
        let mut store = TransformPresetStore::open(&args.config_dir)?;
        let preset = TransformPreset::new(name, args.microscope, args.mounting_method, transform)
            .with_notes(args.notes);
        store.save_preset(preset)?;
    }

    if let (Some(project_dir), Some(sample)) = (args.project_dir, args.sample) {
        let path = save_slide_alignment(&project_dir, &sample, &args.modality, &transform)?;
        println!("Saved alignment to {}", path.display());
    }

    Ok(())
}

fn cmd_tiles(
    output: &Path,
    bounds: &[f64],
    grid: &TileGridParams,
    json: Option<&Path>,
) -> Result<()> {
    let &[x1, y1, x2, y2] = bounds else {
        bail!("--bounds needs exactly 4 values, got {}", bounds.len());
    };

    let tiles = tile_bounding_box(output, (x1, y1), (x2, y2), grid)?;
    println!("Created {} tiles in {}", tiles.len(), output.display());

    if let Some(path) = json {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(file, &tiles)?;
        info!("Wrote tile list to {}", path.display());
    }
    Ok(())
}

fn cmd_transform_tiles(dir: &Path, source: TransformSource, config_dir: &Path) -> Result<()> {
    let transform = match (source.preset, source.coefficients) {
        (Some(name), _) => {
            let store = TransformPresetStore::open(config_dir)?;
            match store.get(&name) {
                Some(preset) => preset.transform,
                None => bail!("No preset named '{name}' in {}", store.path().display()),
            }
        }
        (None, Some(c)) => {
            let Ok(c) = <[f64; 6]>::try_from(c) else {
                bail!("--coefficients needs exactly 6 values");
            };
            AffineTransform2D::from_coefficients(c)
        }
        (None, None) => bail!("Specify --preset or --coefficients"),
    };

    info!("Applying transform {transform}");
    let modified = transform_tile_configuration(dir, &transform)?;
    if modified.is_empty() {
        println!("No TileConfiguration.txt files found under {}", dir.display());
    }
    for name in modified {
        println!("Transformed {name}");
    }
    Ok(())
}

fn cmd_presets(config_dir: &Path, command: PresetCommand) -> Result<()> {
    let mut store = TransformPresetStore::open(config_dir)?;
    match command {
        PresetCommand::List { microscope } => {
            let presets: Vec<&TransformPreset> = match &microscope {
                Some(m) => store.for_microscope(m),
                None => store.all().collect(),
            };
            if presets.is_empty() {
                println!("No presets in {}", store.path().display());
            }
            for p in presets {
                println!(
                    "{:<24} {:<16} {:<16} {}",
                    p.name,
                    p.microscope,
                    p.mounting_method,
                    p.created.format("%Y-%m-%d %H:%M")
                );
            }
        }
        PresetCommand::Show { name } => match store.get(&name) {
            Some(preset) => println!("{}", serde_json::to_string_pretty(preset)?),
            None => bail!("No preset named '{name}'"),
        },
        PresetCommand::Delete { name } => {
            if !store.delete(&name)? {
                bail!("No preset named '{name}'");
            }
            println!("Deleted {name}");
        }
    }
    Ok(())
}

fn load_rgb(path: &Path) -> Result<Array3<u8>> {
    let img = image::open(path)
        .with_context(|| format!("opening image {}", path.display()))?
        .to_rgb8();
    let (width, height) = img.dimensions();
    Ok(Array3::from_shape_vec(
        (height as usize, width as usize, 3),
        img.into_raw(),
    )?)
}

fn save_rgb(rgb: &Array3<u8>, path: &Path) -> Result<()> {
    let (height, width, _) = rgb.dim();
    let img = RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([rgb[[y, x, 0]], rgb[[y, x, 1]], rgb[[y, x, 2]]])
    });
    img.save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn cmd_green_box(
    image_path: &Path,
    params_path: Option<&Path>,
    main_size: Option<(usize, usize)>,
    debug_output: Option<&Path>,
) -> Result<()> {
    let params = match params_path {
        Some(path) => serde_json::from_reader(BufReader::new(File::open(path)?))?,
        None => GreenBoxParams::default(),
    };
    let rgb = load_rgb(image_path)?;
    let detected = detect_green_box(&rgb.view(), &params);

    if let Some(path) = debug_output {
        let mask = green_mask(&rgb.view(), &params);
        save_rgb(&debug_overlay(&rgb.view(), &mask.view(), detected.as_ref()), path)?;
        info!("Wrote debug overlay to {}", path.display());
    }

    let Some(green_box) = detected else {
        bail!("No green box found in {}", image_path.display());
    };
    println!(
        "Green box at ({}, {}) size {}x{}, confidence {:.3}",
        green_box.x, green_box.y, green_box.width, green_box.height, green_box.confidence
    );

    if let Some((width, height)) = main_size {
        match green_box_transform(&green_box, width, height) {
            Some(t) => println!("Macro to main transform: {t}"),
            None => warn!("Detected box is empty, no transform"),
        }
    }
    Ok(())
}

fn cmd_heartbeat(command: HeartbeatCommand) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    // Never signalled; supervision ends on timeout or disconnect
    let (_stop_tx, stop_rx) = watch::channel(false);

    match command {
        HeartbeatCommand::Serve { bind, timeout_secs } => runtime.block_on(async {
            let server = HeartbeatServer::bind(&bind, Duration::from_secs(timeout_secs)).await?;
            println!("Listening on {}", server.local_addr()?);
            let outcome = server.supervise(stop_rx).await?;
            println!("Heartbeat supervision ended: {outcome:?}");
            Ok::<(), anyhow::Error>(())
        }),
        HeartbeatCommand::Send {
            host,
            port,
            interval_secs,
        } => runtime.block_on(async {
            let addr = format!("{host}:{port}");
            let sent =
                run_heartbeat_client(&addr, Duration::from_secs(interval_secs), stop_rx).await?;
            println!("Sent {sent} heartbeats");
            Ok::<(), anyhow::Error>(())
        }),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match args.command {
        Command::Align(align) => cmd_align(align),
        Command::Tiles {
            output,
            bounds,
            grid,
            json,
        } => cmd_tiles(&output, &bounds, &grid, json.as_deref()),
        Command::TransformTiles {
            dir,
            source,
            config_dir,
        } => cmd_transform_tiles(&dir, source, &config_dir),
        Command::Presets {
            config_dir,
            command,
        } => cmd_presets(&config_dir, command),
        Command::GreenBox {
            image,
            params,
            main_width,
            main_height,
            debug_output,
        } => cmd_green_box(
            &image,
            params.as_deref(),
            main_width.zip(main_height),
            debug_output.as_deref(),
        ),
        Command::Heartbeat { command } => cmd_heartbeat(command),
    }
}
