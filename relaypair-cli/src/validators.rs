// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context, Error as AnyErr, Result};
use relaypair::common::protocol::ProtocolVersion;
use std::net::SocketAddr;
use std::path::Path;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(AnyErr::from)
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn parse_protocol_version(v: &str) -> Result<ProtocolVersion> {
  let raw = v
    .parse::<u32>()
    .context("Protocol versions are unsigned integers")?;
  if raw == 0 {
    return Err(AnyErr::msg("Protocol versions start at 1"));
  }
  Ok(ProtocolVersion::new(raw))
}

pub fn validate_protocol_version(v: &str) -> Result<(), String> {
  parse_protocol_version(v)
    .map(|_| ())
    .map_err(|e| e.to_string())
}

pub fn parse_byte_count(v: &str) -> Result<u64> {
  v.parse::<u64>()
    .context("Byte counts are unsigned integers")
}

pub fn validate_byte_count(v: &str) -> Result<(), String> {
  parse_byte_count(v).map(|_| ()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
  use super::{parse_byte_count, parse_protocol_version, parse_socketaddr};
  use relaypair::common::protocol::ProtocolVersion;

  #[test]
  fn protocol_versions_parse_as_tiers() {
    assert_eq!(
      parse_protocol_version("6").unwrap(),
      ProtocolVersion::STREAM_CIPHER
    );
    assert_eq!(parse_protocol_version("12").unwrap().inner(), 12);
    assert!(parse_protocol_version("0").is_err());
    assert!(parse_protocol_version("v3").is_err());
  }

  #[test]
  fn addresses_and_counts() {
    assert_eq!(parse_socketaddr("127.0.0.1:9999").unwrap().port(), 9999);
    assert!(parse_socketaddr("not an address").is_err());
    assert_eq!(parse_byte_count("4096").unwrap(), 4096);
    assert!(parse_byte_count("-1").is_err());
  }
}
