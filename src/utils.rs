//! Small helpers shared by the driver commands.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Read the contents of a file.
pub fn read_file_contents(path: &Path) -> Result<Vec<u8>, io::Error> {
    let mut buffer: Vec<u8> = Vec::new();
    let mut file = File::open(path)?;
    file.read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// Is the buffer a binary module rather than text?
pub fn is_wasm_binary(bytes: &[u8]) -> bool {
    wavm_runtime_core::parse::is_wasm_binary(bytes)
}
