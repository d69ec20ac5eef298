//! SSH identity for the `core` user of every instance.
//!
//! A single RSA key pair is shared by all instances of a project. It is
//! generated on first use, and only when the public key file is absent.

use std::io::Write as _;

use base64::Engine as _;
use camino::Utf8Path;
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::utils::{commit_staged, ensure_parent_dir, staged_file_for};

pub const KEY_BITS: usize = 2048;
pub const KEY_COMMENT: &str = "coreos@container-host";

/// Return the authorized-key line for the project identity, generating a
/// fresh key pair first if `public_path` does not exist.
pub fn ensure_keypair(private_path: &Utf8Path, public_path: &Utf8Path) -> Result<String> {
    match std::fs::read_to_string(public_path) {
        Ok(existing) => {
            info!("SSH key already exists: {public_path}");
            return Ok(existing);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::fs("read", public_path, e)),
    }

    info!("Generating {KEY_BITS}-bit RSA key pair");
    let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, KEY_BITS).map_err(|e| Error::Crypto {
        context: "generating RSA key",
        source: e.into(),
    })?;
    key.validate().map_err(|e| Error::Crypto {
        context: "validating RSA key",
        source: e.into(),
    })?;

    let pem = key.to_pkcs1_pem(LineEnding::LF).map_err(|e| Error::Crypto {
        context: "encoding private key",
        source: e.into(),
    })?;
    let authorized = authorized_key_line(&key.to_public_key());

    create_private_dir(private_path)?;
    write_with_mode(private_path, pem.as_bytes(), 0o600)?;
    ensure_parent_dir(public_path)?;
    write_with_mode(public_path, authorized.as_bytes(), 0o644)?;

    println!("SSH keys generated:");
    println!("  Private key: {private_path}");
    println!("  Public key: {public_path}");
    Ok(authorized)
}

/// Format `key` as `ssh-rsa <base64 blob> <comment>`.
fn authorized_key_line(key: &RsaPublicKey) -> String {
    let mut blob = Vec::new();
    put_string(&mut blob, b"ssh-rsa");
    put_mpint(&mut blob, &key.e().to_bytes_be());
    put_mpint(&mut blob, &key.n().to_bytes_be());
    let encoded = base64::engine::general_purpose::STANDARD.encode(blob);
    format!("ssh-rsa {encoded} {KEY_COMMENT}\n")
}

fn put_string(buf: &mut Vec<u8>, data: &[u8]) {
    // RFC 4251 lengths are u32; a 2048-bit modulus is far below that
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

/// RFC 4251 mpint: big-endian, minimal, with a zero byte if the high bit is set.
fn put_mpint(buf: &mut Vec<u8>, magnitude: &[u8]) {
    let start = magnitude.iter().position(|&b| b != 0).unwrap_or(magnitude.len());
    let digits = &magnitude[start..];
    if digits.first().is_some_and(|&b| b & 0x80 != 0) {
        let mut padded = Vec::with_capacity(digits.len() + 1);
        padded.push(0);
        padded.extend_from_slice(digits);
        put_string(buf, &padded);
    } else {
        put_string(buf, digits);
    }
}

fn create_private_dir(private_path: &Utf8Path) -> Result<()> {
    let Some(dir) = private_path.parent().filter(|p| !p.as_str().is_empty()) else {
        return Ok(());
    };
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .map_err(|e| Error::fs("create directory", dir, e))?;
    debug!("Key directory {dir} ready");
    Ok(())
}

fn write_with_mode(path: &Utf8Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut staged = staged_file_for(path)?;
    staged
        .write_all(contents)
        .map_err(|e| Error::fs("write", path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))
            .map_err(|e| Error::fs("set permissions on", path, e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    commit_staged(staged, path)
}
