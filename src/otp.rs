use rand::rngs::OsRng;
use rand::RngCore;

use crate::errors::OtpError;

pub const DEFAULT_CODE_LENGTH: usize = 6;

// Largest multiple of 10 that fits in a byte; bytes at or above it are redrawn
// so every digit is equally likely.
const UNBIASED_LIMIT: u8 = 250;

/// Produces one-time verification codes.
pub trait CodeGenerator: Send + Sync {
    fn generate(&self) -> Result<String, OtpError>;
}

/// Numeric codes of a fixed length drawn from the operating system's CSPRNG.
#[derive(Debug, Clone, Copy)]
pub struct DigitCodeGenerator {
    length: usize,
}

impl DigitCodeGenerator {
    pub fn new(length: usize) -> Self {
        Self { length }
    }

    fn fill(&self, rng: &mut impl RngCore) -> Result<String, OtpError> {
        let mut code = String::with_capacity(self.length);
        let mut buffer = vec![0u8; self.length];

        while code.len() < self.length {
            rng.try_fill_bytes(&mut buffer)?;
            for byte in buffer.iter().copied().filter(|b| *b < UNBIASED_LIMIT) {
                if code.len() == self.length {
                    break;
                }
                code.push(char::from(b'0' + byte % 10));
            }
        }

        Ok(code)
    }
}

impl Default for DigitCodeGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_LENGTH)
    }
}

impl CodeGenerator for DigitCodeGenerator {
    fn generate(&self) -> Result<String, OtpError> {
        self.fill(&mut OsRng)
    }
}
