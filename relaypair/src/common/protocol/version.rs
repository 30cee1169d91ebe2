// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Protocol version tiers and the transport strategy each tier implies
//!
//! Tiers are plain integers shared between peers; both sides must agree on the ordering.
//! The getting side negotiates from the lowest version both peers speak, while the
//! sharing side only distinguishes legacy peers from bridge-capable ones.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ProtocolVersion(u32);

impl ProtocolVersion {
  /// Direct peer connection, predating the bridge layer
  pub const PRE_BRIDGE: ProtocolVersion = ProtocolVersion(1);
  /// Layered bridge construction without obfuscation
  pub const BRIDGE: ProtocolVersion = ProtocolVersion(2);
  /// Bridge with basic Caesar-style obfuscation
  pub const CAESAR: ProtocolVersion = ProtocolVersion(3);
  pub const HOLOGRAPHIC_ICE: ProtocolVersion = ProtocolVersion(4);
  pub const ENCRYPTED_SIGNALS: ProtocolVersion = ProtocolVersion(5);
  /// Holographic ICE with a stream cipher keyed per session
  pub const STREAM_CIPHER: ProtocolVersion = ProtocolVersion(6);

  /// The newest tier this build speaks
  pub const CURRENT: ProtocolVersion = Self::STREAM_CIPHER;

  pub const fn new(inner: u32) -> ProtocolVersion {
    Self(inner)
  }

  pub const fn inner(&self) -> u32 {
    self.0
  }
}

impl Default for ProtocolVersion {
  fn default() -> Self {
    Self::CURRENT
  }
}

impl From<u32> for ProtocolVersion {
  fn from(inner: u32) -> Self {
    Self::new(inner)
  }
}

impl From<ProtocolVersion> for u32 {
  fn from(version: ProtocolVersion) -> Self {
    version.inner()
  }
}

impl fmt::Debug for ProtocolVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("ProtocolVersion").field(&self.0).finish()
  }
}

impl fmt::Display for ProtocolVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "v{}", self.0)
  }
}

/// Key material for the stream-cipher obfuscation tier
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamCipherKey([u8; StreamCipherKey::LEN]);

impl StreamCipherKey {
  pub const LEN: usize = 16;

  pub fn generate() -> Self {
    let mut key = [0u8; Self::LEN];
    rand::thread_rng().fill_bytes(&mut key);
    Self(key)
  }

  pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
    Self(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; Self::LEN] {
    &self.0
  }
}

impl fmt::Debug for StreamCipherKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("StreamCipherKey(<redacted>)")
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum Obfuscation {
  None,
  Caesar,
  StreamCipher(StreamCipherKey),
  /// Adopt whichever obfuscation the remote offers on each message
  Negotiated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "construction", rename_all = "snake_case")]
pub enum TransportStrategy {
  /// Direct peer connection without the bridge layer
  Legacy,
  Bridge {
    holographic_ice: bool,
    obfuscation: Obfuscation,
  },
}

impl TransportStrategy {
  pub fn is_legacy(&self) -> bool {
    matches!(self, Self::Legacy)
  }

  pub fn obfuscation(&self) -> Option<&Obfuscation> {
    match self {
      Self::Legacy => None,
      Self::Bridge { obfuscation, .. } => Some(obfuscation),
    }
  }
}

pub struct VersionNegotiator;

impl VersionNegotiator {
  pub fn common_version(local: ProtocolVersion, remote: ProtocolVersion) -> ProtocolVersion {
    std::cmp::min(local, remote)
  }

  /// Selects the transport for a getting attempt from the lowest version both peers speak
  ///
  /// Versions newer than every named tier use the newest known strategy, which draws a
  /// fresh stream-cipher key on every call.
  pub fn getting_strategy(local: ProtocolVersion, remote: ProtocolVersion) -> TransportStrategy {
    let common = Self::common_version(local, remote);
    match common {
      v if v <= ProtocolVersion::PRE_BRIDGE => TransportStrategy::Legacy,
      ProtocolVersion::BRIDGE => TransportStrategy::Bridge {
        holographic_ice: false,
        obfuscation: Obfuscation::None,
      },
      ProtocolVersion::CAESAR => TransportStrategy::Bridge {
        holographic_ice: false,
        obfuscation: Obfuscation::Caesar,
      },
      ProtocolVersion::HOLOGRAPHIC_ICE | ProtocolVersion::ENCRYPTED_SIGNALS => {
        TransportStrategy::Bridge {
          holographic_ice: true,
          obfuscation: Obfuscation::Caesar,
        }
      }
      _ => TransportStrategy::Bridge {
        holographic_ice: true,
        obfuscation: Obfuscation::StreamCipher(StreamCipherKey::generate()),
      },
    }
  }

  /// Selects the transport for a sharing attempt from the remote's advertised version alone
  pub fn sharing_strategy(remote: ProtocolVersion) -> TransportStrategy {
    if remote < ProtocolVersion::BRIDGE {
      TransportStrategy::Legacy
    } else {
      TransportStrategy::Bridge {
        holographic_ice: true,
        obfuscation: Obfuscation::Negotiated,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{Obfuscation, ProtocolVersion as V, TransportStrategy, VersionNegotiator};

  fn getting(local: u32, remote: u32) -> TransportStrategy {
    VersionNegotiator::getting_strategy(V::new(local), V::new(remote))
  }

  #[test]
  fn legacy_remote_selects_direct_construction() {
    assert_eq!(getting(5, 1), TransportStrategy::Legacy);
    // Anything below the first named tier is treated as legacy too
    assert_eq!(getting(5, 0), TransportStrategy::Legacy);
  }

  #[test]
  fn lowest_common_tier_wins() {
    assert_eq!(
      getting(5, 3),
      TransportStrategy::Bridge {
        holographic_ice: false,
        obfuscation: Obfuscation::Caesar,
      }
    );
    assert_eq!(getting(3, 5), getting(5, 3));
    assert_eq!(
      getting(6, 2),
      TransportStrategy::Bridge {
        holographic_ice: false,
        obfuscation: Obfuscation::None,
      }
    );
  }

  #[test]
  fn holographic_tiers_share_behaviour() {
    let expected = TransportStrategy::Bridge {
      holographic_ice: true,
      obfuscation: Obfuscation::Caesar,
    };
    assert_eq!(getting(6, 4), expected);
    assert_eq!(getting(5, 5), expected);
  }

  #[test]
  fn newest_tier_draws_fresh_stream_cipher_keys() {
    let first = getting(6, 6);
    let second = getting(6, 9);
    let key_of = |strategy: &TransportStrategy| match strategy {
      TransportStrategy::Bridge {
        holographic_ice: true,
        obfuscation: Obfuscation::StreamCipher(key),
      } => key.clone(),
      other => panic!("Expected stream cipher strategy, got {:?}", other),
    };
    assert_ne!(key_of(&first), key_of(&second));
  }

  #[test]
  fn sharing_branches_only_on_bridge_support() {
    assert!(VersionNegotiator::sharing_strategy(V::PRE_BRIDGE).is_legacy());
    assert_eq!(
      VersionNegotiator::sharing_strategy(V::CAESAR).obfuscation(),
      Some(&Obfuscation::Negotiated)
    );
    assert_eq!(
      VersionNegotiator::sharing_strategy(V::new(42)).obfuscation(),
      Some(&Obfuscation::Negotiated)
    );
  }
}
