//! Thin command-line entry for the waybridge server endpoint: argument
//! parsing, logging and signal setup, then a straight dispatch into the
//! session supervisor.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Arg, ArgAction, Command, value_parser};
use compress::Algorithm;
use supervisor::config::{SessionConfig, VideoMode};
use supervisor::server::{ServerOptions, run_server};
use supervisor::signal;
use tracing_subscriber::EnvFilter;

fn parse_video(mode: &str) -> Result<VideoMode, String> {
    match mode {
        "off" => Ok(VideoMode::Off),
        "vaapi" => Ok(VideoMode::Vaapi),
        "sw" => Ok(VideoMode::Software),
        other => Err(format!("unknown video mode {other:?} (expected off, vaapi, or sw)")),
    }
}

fn parse_compress(spec: &str) -> Result<Algorithm, String> {
    spec.parse().map_err(|err| format!("{err}"))
}

fn cli() -> Command {
    Command::new("waybridge")
        .about("Forward a Wayland session over a single byte-stream channel")
        .arg(
            Arg::new("socket")
                .long("socket")
                .short('s')
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .required(true)
                .help("Unix socket of the channel's local end"),
        )
        .arg(
            Arg::new("display")
                .long("display")
                .value_name("NAME")
                .value_parser(value_parser!(OsString))
                .default_value("wayland-wb0")
                .help("Display socket name, or an absolute path"),
        )
        .arg(
            Arg::new("control")
                .long("control")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Control FIFO; makes the session reconnectable"),
        )
        .arg(
            Arg::new("oneshot")
                .long("oneshot")
                .action(ArgAction::SetTrue)
                .help("Serve exactly one application connection"),
        )
        .arg(
            Arg::new("unlink")
                .long("unlink-on-exit")
                .action(ArgAction::SetTrue)
                .help("Remove the display socket when the session ends"),
        )
        .arg(
            Arg::new("compress")
                .long("compress")
                .short('c')
                .value_name("ALGO")
                .value_parser(parse_compress)
                .default_value("none")
                .help("Diff payload compression: none, lz4, or zstd[:level]"),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .default_value("0")
                .help("Worker pool threads per connection (0 = automatic)"),
        )
        .arg(
            Arg::new("drm-node")
                .long("drm-node")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .help("Render node used to import DMABUFs"),
        )
        .arg(
            Arg::new("no-gpu")
                .long("no-gpu")
                .action(ArgAction::SetTrue)
                .help("Refuse GPU buffers entirely"),
        )
        .arg(
            Arg::new("video")
                .long("video")
                .value_name("MODE")
                .value_parser(parse_video)
                .default_value("off")
                .help("Video encoding for surfaces: off, vaapi, or sw"),
        )
        .arg(
            Arg::new("login-shell")
                .long("login-shell")
                .action(ArgAction::SetTrue)
                .help("Run $SHELL as a login shell when no command is given"),
        )
        .arg(
            Arg::new("command")
                .value_name("COMMAND")
                .action(ArgAction::Append)
                .num_args(0..)
                .allow_hyphen_values(true)
                .trailing_var_arg(true)
                .value_parser(value_parser!(OsString))
                .help("Application to launch; defaults to $SHELL"),
        )
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("WAYBRIDGE_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    if let Err(err) = signal::install_handlers() {
        eprintln!("waybridge: could not install signal handlers: {err}");
        std::process::exit(1);
    }

    let config = SessionConfig::builder()
        .compression(*matches.get_one::<Algorithm>("compress").expect("default"))
        .video(*matches.get_one::<VideoMode>("video").expect("default"))
        .threads(*matches.get_one::<usize>("threads").expect("default"))
        .dmabuf_device(matches.get_one::<PathBuf>("drm-node").cloned())
        .no_gpu(matches.get_flag("no-gpu"))
        .build();

    let options = ServerOptions {
        channel_socket: matches
            .get_one::<PathBuf>("socket")
            .expect("required")
            .clone(),
        wayland_display: matches
            .get_one::<OsString>("display")
            .expect("default")
            .clone(),
        control_path: matches.get_one::<PathBuf>("control").cloned(),
        config,
        oneshot: matches.get_flag("oneshot"),
        unlink_at_end: matches.get_flag("unlink"),
        command: matches
            .get_many::<OsString>("command")
            .map(|values| values.cloned().collect())
            .unwrap_or_default(),
        login_shell: matches.get_flag("login-shell"),
    };

    match run_server(options) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("waybridge: {err}");
            std::process::exit(1);
        }
    }
}
