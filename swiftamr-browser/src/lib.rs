#[cfg(target_arch = "wasm32")]
mod wasm;

#[cfg(target_arch = "wasm32")]
pub use wasm::SwiftAmrEngine;

#[cfg(not(target_arch = "wasm32"))]
pub struct SwiftAmrEngine;

#[cfg(not(target_arch = "wasm32"))]
impl SwiftAmrEngine {
    pub fn new() -> Self {
        SwiftAmrEngine
    }

    pub fn build_index(&mut self, _fasta_data: &[u8]) -> Result<u32, String> {
        Err("swiftamr-browser is only available when compiled for wasm32-unknown-unknown".to_string())
    }

    pub fn align_fastq(&mut self, _fastq_data: &[u8]) -> String {
        "ERROR: swiftamr-browser is only available when compiled for wasm32-unknown-unknown".to_string()
    }
}
