// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use rand::Rng;

/// Length of a generated proxying session id
pub const PROXYING_ID_LEN: usize = 16;

/// Produces correlation tokens identifying one getting attempt
///
/// Ids only correlate logs across peers; they are not secrets.
pub trait SessionIdGenerator {
  fn generate(&self) -> String;
}

/// Draws lowercase ASCII letters from the thread-local, non-cryptographic RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomLowercaseGenerator;

impl SessionIdGenerator for RandomLowercaseGenerator {
  fn generate(&self) -> String {
    let mut rng = rand::thread_rng();
    (0..PROXYING_ID_LEN)
      .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::{RandomLowercaseGenerator, SessionIdGenerator, PROXYING_ID_LEN};

  #[test]
  fn ids_are_lowercase_and_fixed_length() {
    let generator = RandomLowercaseGenerator;
    for _ in 0..64 {
      let id = generator.generate();
      assert_eq!(id.len(), PROXYING_ID_LEN);
      assert!(id.chars().all(|c| c.is_ascii_lowercase()), "{}", id);
    }
  }

  #[test]
  fn ids_vary_between_calls() {
    let generator = RandomLowercaseGenerator;
    // 26^16 possibilities; a collision here means the generator is not random at all
    assert_ne!(generator.generate(), generator.generate());
  }
}
