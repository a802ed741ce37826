//! Embeds the updater that `--update` hands off to.
//!
//! Set `TUNNELKEEPER_UPDATER_PAYLOAD` to the updater binary when building a release.
//! Without it the payload is empty and `--update` fails at runtime.

use std::path::PathBuf;
use std::{env, fs, io};

const PAYLOAD_ENV: &str = "TUNNELKEEPER_UPDATER_PAYLOAD";

fn main() -> io::Result<()> {
    println!("cargo:rerun-if-env-changed={PAYLOAD_ENV}");

    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| io::Error::other("OUT_DIR is not set"))?;
    let dest = out_dir.join("updater.bin");

    match env::var_os(PAYLOAD_ENV) {
        Some(source) => {
            let source = PathBuf::from(source);
            println!("cargo:rerun-if-changed={}", source.display());
            fs::copy(&source, &dest)?;
        }
        None => fs::write(&dest, [])?,
    }

    Ok(())
}
