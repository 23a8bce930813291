use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use git_cdn_rs::{logger, Config, Options};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = match parse_options() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(1);
        }
    };

    logger::init().expect("global logger hasn't already been set");

    tracing::info!("version {}-{}", env!("CARGO_PKG_VERSION"), env!("GIT_HEAD"));

    match git_cdn_rs::run(options).await {
        Ok(()) => {}
        Err(err) => {
            tracing::error!("fatal: {:#}", err);
            process::exit(1);
        }
    }
    Ok(())
}

/// Parse command-line arguments, then overlay the process environment
/// on top of whatever defaults survive.
fn parse_options() -> anyhow::Result<Options> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_env();
    let mut listen = None;
    let mut workdir = None;
    let mut upstream = None;

    while let Some(arg) = parser.next()? {
        match arg {
            Long("listen") => {
                listen = Some(parser.value()?.parse()?);
            }
            Long("workdir") | Short('w') => {
                workdir = Some(PathBuf::from(parser.value()?));
            }
            Long("upstream") | Short('u') => {
                upstream = Some(parser.value()?.parse()?);
            }
            Long("help") | Short('h') => {
                println!(
                    "usage: git-cdn [--listen <addr>] --workdir <path> --upstream <url>"
                );
                process::exit(0);
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    let workdir = workdir
        .or_else(|| std::env::var_os("WORKING_DIRECTORY").map(PathBuf::from))
        .ok_or_else(|| anyhow::anyhow!("--workdir or WORKING_DIRECTORY is required"))?;
    let upstream = upstream
        .or_else(|| std::env::var("GIT_CDN_UPSTREAM").ok())
        .ok_or_else(|| anyhow::anyhow!("--upstream or GIT_CDN_UPSTREAM is required"))?;
    let listen: SocketAddr = listen.unwrap_or_else(|| ([0, 0, 0, 0], 8080).into());

    let config = Config::from_env(workdir, upstream)?;

    Ok(Options { listen, config })
}
