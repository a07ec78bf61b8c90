//! Headless residency simulator
//!
//! Drives the feedback manager through a scripted camera sweep over a set of
//! sparse textures and prints residency statistics as it goes.
//!
//! Usage:
//!     residency_sim [OPTIONS]
//!
//! Options:
//!     -c, --config <PATH>     Residency config JSON (default: built-in defaults)
//!     --save-config <PATH>    Write the effective config to PATH and exit
//!     -f, --frames <N>        Frames to simulate (default: 600)
//!     -t, --textures <N>      Number of textures (default: 4)
//!     -s, --size <PIXELS>     Texture width and height (default: 4096)
//!     --radius <REGIONS>      Sampled radius around the focus point (default: 12)
//!     --debug-server [PORT]   Serve stats to debug clients (default port: 9743)
//!     -v, --verbose           Log per-frame summaries
//!     -h, --help              Show this help message

use std::env;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tilestream::core::logging;
use tilestream::core::time::ManualClock;
use tilestream::debug::{SharedDebugState, lock_state, spawn_debug_server};
use tilestream::residency::{
    FeedbackManager, FeedbackTexture, HeadlessCommandList, HeadlessDevice, MIN_MIP_NOT_SAMPLED,
    ResidencyConfig, TextureDesc, TextureFormat,
};

const FRAME_SECONDS: f32 = 1.0 / 60.0;

fn print_help() {
    eprintln!("residency_sim - Headless sampler feedback residency simulator");
    eprintln!();
    eprintln!("Usage: residency_sim [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("    -c, --config <PATH>     Residency config JSON (default: built-in defaults)");
    eprintln!("    --save-config <PATH>    Write the effective config to PATH and exit");
    eprintln!("    -f, --frames <N>        Frames to simulate (default: 600)");
    eprintln!("    -t, --textures <N>      Number of textures (default: 4)");
    eprintln!("    -s, --size <PIXELS>     Texture width and height (default: 4096)");
    eprintln!("    --radius <REGIONS>      Sampled radius around the focus point (default: 12)");
    eprintln!("    --debug-server [PORT]   Serve stats to debug clients (default port: 9743)");
    eprintln!("    -v, --verbose           Log per-frame summaries");
    eprintln!("    -h, --help              Show this help message");
    eprintln!();
    eprintln!("Example:");
    eprintln!("    residency_sim -f 1200 -t 8 --debug-server");
    eprintln!("    residency_sim --save-config ./residency.json");
}

#[derive(Debug)]
struct Args {
    config: Option<PathBuf>,
    save_config: Option<PathBuf>,
    frames: u64,
    textures: u32,
    size: u32,
    radius: f32,
    debug_port: Option<u16>,
    verbose: bool,
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, name: &str) -> Result<T, String> {
    let value = args.get(i).ok_or_else(|| format!("Missing value for {}", name))?;
    value.parse().map_err(|_| format!("Invalid value for {}: {}", name, value))
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().skip(1).collect();

    let mut parsed = Args {
        config: None,
        save_config: None,
        frames: 600,
        textures: 4,
        size: 4096,
        radius: 12.0,
        debug_port: None,
        verbose: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                parsed.config = Some(PathBuf::from(parse_value::<String>(&args, i, "--config")?));
            }
            "--save-config" => {
                i += 1;
                parsed.save_config = Some(PathBuf::from(parse_value::<String>(&args, i, "--save-config")?));
            }
            "-f" | "--frames" => {
                i += 1;
                parsed.frames = parse_value(&args, i, "--frames")?;
            }
            "-t" | "--textures" => {
                i += 1;
                parsed.textures = parse_value(&args, i, "--textures")?;
            }
            "-s" | "--size" => {
                i += 1;
                parsed.size = parse_value(&args, i, "--size")?;
                if parsed.size == 0 {
                    return Err("--size must be positive".to_string());
                }
            }
            "--radius" => {
                i += 1;
                parsed.radius = parse_value(&args, i, "--radius")?;
            }
            "-v" | "--verbose" => parsed.verbose = true,
            "--debug-server" => {
                // optional port
                match args.get(i + 1).and_then(|v| v.parse::<u16>().ok()) {
                    Some(port) => {
                        parsed.debug_port = Some(port);
                        i += 1;
                    }
                    None => parsed.debug_port = Some(tilestream_debug::DEFAULT_PORT),
                }
            }
            other => return Err(format!("Unknown argument: {}", other)),
        }
        i += 1;
    }

    Ok(parsed)
}

/// Feedback of one texture: finest mip near the focus, coarser further out
fn scripted_feedback(texture: &FeedbackTexture, focus: glam::Vec2, radius: f32) -> Vec<u8> {
    let grid = texture.region_grid();
    let coarsest = texture.packed_mip_desc().num_standard_mips.saturating_sub(1) as f32;
    let mut min_mips = vec![MIN_MIP_NOT_SAMPLED; (grid.x * grid.y) as usize];
    for y in 0..grid.y {
        for x in 0..grid.x {
            let d = (glam::Vec2::new(x as f32, y as f32) - focus).length();
            if d <= radius {
                let mip = (d / radius * (coarsest + 1.0)).floor().min(coarsest);
                min_mips[(y * grid.x + x) as usize] = mip as u8;
            }
        }
    }
    min_mips
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_help();
            std::process::exit(1);
        }
    };

    if args.verbose {
        logging::init_with_filter("debug");
    } else {
        logging::init();
    }

    let mut config = match &args.config {
        Some(path) => match ResidencyConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => ResidencyConfig::default(),
    };

    if let Some(path) = &args.save_config {
        if let Err(e) = config.save(path) {
            eprintln!("Error saving config {}: {}", path.display(), e);
            std::process::exit(1);
        }
        println!("Wrote {}", path.display());
        return;
    }

    println!("Residency Simulator");
    println!("===================");
    println!("Textures: {} x {}x{}", args.textures, args.size, args.size);
    println!("Frames: {}", args.frames);
    println!("Heap size: {} tiles", config.manager.heap_size_in_tiles);
    println!("Frames in flight: {}", config.manager.num_frames_in_flight);
    println!();

    let debug_state = Arc::new(Mutex::new(SharedDebugState::default()));
    if let Some(port) = args.debug_port {
        spawn_debug_server(debug_state.clone(), port);
    }

    let device = Rc::new(HeadlessDevice::new());
    let clock = Rc::new(ManualClock::new(0.0));
    let mut manager = FeedbackManager::with_clock(device.clone(), config.manager, clock.clone());

    let desc = TextureDesc::new(
        args.size,
        args.size,
        TextureDesc::full_mip_count(args.size, args.size),
        TextureFormat::Bc7Unorm,
    );
    let mut textures = Vec::new();
    for _ in 0..args.textures {
        match manager.create_texture(&desc) {
            Ok(texture) => textures.push(texture),
            Err(e) => {
                eprintln!("Error creating texture: {}", e);
                std::process::exit(1);
            }
        }
    }

    let start = Instant::now();
    let mut tiles_filled = 0usize;
    for frame in 0..args.frames {
        lock_state(&debug_state).apply_overrides(&mut config.update);
        config.update.frame_index = frame;

        let mut cmd = HeadlessCommandList::new();
        let updates = manager.begin_frame(&mut cmd, &config.update);
        // content is produced instantly
        tiles_filled += updates.num_tiles();
        manager.update_tile_mappings(&mut cmd, &updates);
        cmd.submit(&device);

        // sweep the focus point across each texture, offset per texture
        for (i, texture) in textures.iter().enumerate() {
            let grid = texture.region_grid().as_vec2();
            let t = frame as f32 * 0.01 + i as f32 * 0.7;
            let focus = grid * 0.5 + glam::Vec2::new(t.cos(), t.sin()) * grid * 0.35;
            device.write_feedback(texture.feedback_texture(), &scripted_feedback(texture, focus, args.radius));
        }
        manager.resolve_feedback(&mut cmd);
        cmd.submit(&device);
        manager.end_frame();
        clock.advance(FRAME_SECONDS);

        lock_state(&debug_state).publish(&manager);

        if (frame + 1) % 60 == 0 || frame + 1 == args.frames {
            let stats = manager.stats();
            println!(
                "frame {:5}: {:3} heaps ({:6.1} MB), {:6} allocated, {:6} standby, {:5} requested",
                frame + 1,
                stats.heap_count,
                stats.heap_allocation_bytes as f64 / (1024.0 * 1024.0),
                stats.tiles_allocated,
                stats.tiles_standby,
                stats.tiles_requested,
            );
        }
    }

    let elapsed = start.elapsed();
    println!();
    println!("Summary:");
    println!("  Tiles filled: {}", tiles_filled);
    println!("  Tile mapping calls: {}", device.num_mapping_calls());
    println!(
        "  Total time: {:.2}s ({:.1} frames/sec)",
        elapsed.as_secs_f64(),
        args.frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
}
