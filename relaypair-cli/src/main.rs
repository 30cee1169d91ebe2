// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use relaypair::common::{
  protocol::{ProtocolVersion, VersionNegotiator},
  session::SessionConfig,
};

use validators::{
  parse_byte_count, parse_protocol_version, parse_socketaddr, validate_byte_count,
  validate_existing_file, validate_protocol_version, validate_socketaddr,
};

mod demo;
mod validators;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relaypair=debug,info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let current_version = ProtocolVersion::CURRENT.inner().to_string();
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("negotiate")
        .about("Show the transport strategies two protocol versions select")
        .arg(
          Arg::new("local")
            .long("local")
            .short('l')
            .validator(validate_protocol_version)
            .default_value(&current_version)
            .takes_value(true),
        )
        .arg(
          Arg::new("remote")
            .long("remote")
            .short('r')
            .validator(validate_protocol_version)
            .takes_value(true)
            .required(true),
        ),
    )
    .subcommand(
      Command::new("demo")
        .about("Run a getting and a sharing session against each other in-process")
        .arg(
          Arg::new("remote-version")
            .long("remote-version")
            .short('r')
            .help("Protocol version advertised by the sharing session")
            .validator(validate_protocol_version)
            .default_value(&current_version)
            .takes_value(true),
        )
        .arg(
          Arg::new("bytes")
            .long("bytes")
            .short('b')
            .validator(validate_byte_count)
            .default_value("4096")
            .takes_value(true),
        )
        .arg(
          Arg::new("config")
            .long("config")
            .short('c')
            .help("JSON session configuration for the getting session")
            .validator(validate_existing_file)
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("listen")
            .long("listen")
            .help("Local proxy address, overriding the configuration")
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(false),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

pub fn demo_arg_handling(args: &'_ ArgMatches) -> Result<demo::DemoArgs> {
  let mut getter = match args.value_of("config") {
    Some(path) => {
      let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Reading session configuration from {}", path))?;
      SessionConfig::from_json(&raw)
        .with_context(|| format!("Parsing session configuration from {}", path))?
    }
    None => SessionConfig::default(),
  };
  if let Some(listen) = args.value_of("listen") {
    getter.listen_addr = parse_socketaddr(listen)?;
  }
  Ok(demo::DemoArgs {
    getter,
    remote_version: parse_protocol_version(args.value_of("remote-version").unwrap())?,
    bytes: parse_byte_count(args.value_of("bytes").unwrap())?,
  })
}

fn negotiate_main(local: ProtocolVersion, remote: ProtocolVersion) {
  println!(
    "common version: {}",
    VersionNegotiator::common_version(local, remote)
  );
  println!(
    "getting strategy: {:?}",
    VersionNegotiator::getting_strategy(local, remote)
  );
  println!(
    "sharing strategy: {:?}",
    VersionNegotiator::sharing_strategy(remote)
  );
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("negotiate", opts) => {
      let local = parse_protocol_version(opts.value_of("local").unwrap())?;
      let remote = parse_protocol_version(opts.value_of("remote").unwrap())?;
      negotiate_main(local, remote);
      Ok(())
    }
    ("demo", opts) => {
      let config = demo_arg_handling(opts)?;
      tracing::info!("Running demo with config {:#?}", config);
      demo::demo_main(config).await
    }
    (_, _) => unreachable!(),
  }
}
