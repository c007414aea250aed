//! Software reference cipher and block helpers

use crate::{Error, Result};
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

/// One 128-bit cipher block, most significant byte first
pub type Block = [u8; 16];

/// Software encryption used to cross-check the hardware ciphertext
pub trait ReferenceCipher {
    fn encrypt(&self, plaintext: &Block, key: &Block) -> Block;
}

/// AES-128 from the `aes` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct Aes128Reference;

impl ReferenceCipher for Aes128Reference {
    fn encrypt(&self, plaintext: &Block, key: &Block) -> Block {
        let cipher = Aes128::new(&(*key).into());
        let mut block: aes::Block = (*plaintext).into();
        cipher.encrypt_block(&mut block);
        block.into()
    }
}

/// `plaintext XOR key`, for wiring tests without a real cipher
#[derive(Debug, Clone, Copy, Default)]
pub struct XorCipher;

impl ReferenceCipher for XorCipher {
    fn encrypt(&self, plaintext: &Block, key: &Block) -> Block {
        let mut out = [0u8; 16];
        for (o, (p, k)) in out.iter_mut().zip(plaintext.iter().zip(key)) {
            *o = p ^ k;
        }
        out
    }
}

impl<C: ReferenceCipher + ?Sized> ReferenceCipher for Box<C> {
    fn encrypt(&self, plaintext: &Block, key: &Block) -> Block {
        (**self).encrypt(plaintext, key)
    }
}

/// Parse a 32-digit hex string into a block
pub fn parse_block(s: &str) -> Result<Block> {
    let trimmed = s.trim().trim_start_matches("0x");
    let bytes = hex::decode(trimmed).map_err(|e| Error::Config(format!("Invalid hex block '{}': {}", s, e)))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| Error::Config(format!("Block '{}' has {} bytes, expected 16", s, v.len())))
}

/// Fill a block from the random source
pub fn random_block<R: rand::RngCore + ?Sized>(rng: &mut R) -> Block {
    let mut block = [0u8; 16];
    rng.fill_bytes(&mut block);
    block
}
