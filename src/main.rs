use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use echoc::{Config, Interpreter};
use tracing_subscriber::EnvFilter;

/// `echoc <SCRIPT>` (spec §6): a single script path, exit code 0 on a
/// clean run, 1 on any unhandled lexical/syntax/runtime/system error.
#[derive(Parser, Debug)]
#[clap(name = "echoc", version)]
struct Cli {
  /// Path to the `.ec` script to run.
  script: PathBuf,

  /// Render diagnostics with a source snippet instead of the plain
  /// `[EchoC Kind Error] at line L, col C: msg` form.
  #[clap(long)]
  pretty: bool,

  /// Raise the tracing log level; repeatable (`-v`, `-vv`, ...).
  #[clap(short, long, action = clap::ArgAction::Count)]
  verbose: u8,
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let src = match std::fs::read_to_string(&cli.script) {
    Ok(src) => src,
    Err(e) => {
      eprintln!("could not read `{}`: {e}", cli.script.display());
      return ExitCode::FAILURE;
    }
  };

  let interp = Interpreter::new(Config::from_env());
  let dir = cli.script.parent().map(|p| p.to_path_buf());
  match interp.run_str(src.clone(), dir) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      if cli.pretty {
        eprint!("{}", render_pretty(&cli.script.display().to_string(), &src, &err));
      } else {
        eprintln!("{}", err.render(&src));
      }
      ExitCode::FAILURE
    }
  }
}

fn init_tracing(verbose: u8) {
  let default = match verbose {
    0 => "echoc=warn",
    1 => "echoc=info",
    2 => "echoc=debug",
    _ => "echoc=trace",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// `--pretty`: a `diag::Report`-rendered snippet when the error carries a
/// span; falls back to the plain spec §6 line otherwise (e.g. a
/// `System`/`Internal` error raised with no source location).
fn render_pretty(name: &str, src: &str, err: &echoc::Error) -> String {
  let Some(span) = err.span else {
    return format!("{}\n", err.render(src));
  };
  let report = diag::Report::error()
    .source(diag::Source::file(name, src))
    .message(format!("{} error: {}", err.kind, err.message))
    .span(span)
    .build();
  match report.emit_to_string() {
    Ok(s) => s,
    Err(_) => format!("{}\n", err.render(src)),
  }
}
