// Secure random secret generation (ring SystemRandom).

use anyhow::Result;
use ring::rand::{SecureRandom, SystemRandom};

use crate::models::secrets::{SecretBundle, SecretKey, SecretRequirement};

pub struct SecretGenerator {
    rng: SystemRandom,
}

impl Default for SecretGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretGenerator {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }

    /// Draw one character uniformly from `alphabet` (rejection sampling, no modulo bias).
    fn pick(&self, alphabet: &[u8]) -> Result<u8> {
        let n = alphabet.len();
        if n == 0 || n > 256 {
            anyhow::bail!("Internal error: alphabet size {} out of range", n);
        }
        let limit = 256 - (256 % n);
        let mut buf = [0u8; 32];
        loop {
            self.rng
                .fill(&mut buf)
                .map_err(|_| anyhow::anyhow!("Secure random source unavailable"))?;
            if let Some(b) = buf.iter().find(|b| (**b as usize) < limit) {
                return Ok(alphabet[*b as usize % n]);
            }
        }
    }

    /// Generate a value meeting `req` exactly (length == min_len).
    pub fn generate(&self, req: &SecretRequirement) -> Result<String> {
        let mut out = String::with_capacity(req.min_len);
        for i in 0..req.min_len {
            let alphabet = if i == 0 && req.leading_letter {
                req.class.letters()
            } else {
                req.class.alphabet()
            };
            out.push(self.pick(alphabet)? as char);
        }
        Ok(out)
    }

    pub fn generate_for(&self, key: SecretKey) -> Result<String> {
        self.generate(&key.requirement())
    }

    /// A bundle with every key freshly generated.
    pub fn generate_bundle(&self) -> Result<SecretBundle> {
        let mut bundle = SecretBundle::new();
        self.fill_missing(&mut bundle)?;
        Ok(bundle)
    }

    /// Generate values for the keys that are empty; returns the keys that were filled.
    pub fn fill_missing(&self, bundle: &mut SecretBundle) -> Result<Vec<SecretKey>> {
        let missing = bundle.missing_keys();
        for key in &missing {
            bundle.set(*key, self.generate_for(*key)?);
        }
        Ok(missing)
    }
}
