use wasm_bindgen::prelude::*;

use swiftamr_core::{align_batch, stats_text, write_tsv, EngineError, KmerIndex};

fn to_js<E: std::fmt::Display>(err: E) -> JsValue {
    JsValue::from_str(&err.to_string())
}

#[wasm_bindgen]
pub struct SwiftAmrEngine {
    index: Option<KmerIndex>,
}

#[wasm_bindgen]
impl SwiftAmrEngine {
    #[wasm_bindgen(constructor)]
    pub fn new() -> SwiftAmrEngine {
        SwiftAmrEngine { index: None }
    }

    /// Build a fresh index from reference FASTA bytes, replacing any
    /// prior index. Returns the number of genes indexed.
    #[wasm_bindgen]
    pub fn build_index(&mut self, fasta_data: &[u8]) -> Result<u32, JsValue> {
        // Prior handles are stale from here on, even if the build fails.
        self.index = None;
        let index = KmerIndex::build_from_fasta(fasta_data).map_err(to_js)?;
        let genes = index.num_genes() as u32;
        self.index = Some(index);
        Ok(genes)
    }

    /// Align FASTQ bytes against the current index and return the TSV
    /// report. On failure the first row begins with `ERROR:`.
    #[wasm_bindgen]
    pub fn align_fastq(&mut self, fastq_data: &[u8]) -> String {
        let Some(index) = &self.index else {
            return format!("ERROR: {}", EngineError::NoIndex);
        };
        match align_batch(index, fastq_data) {
            Ok(batch) => write_tsv(index, &batch),
            Err(e) => format!("ERROR: {e}"),
        }
    }

    #[wasm_bindgen]
    pub fn get_stats(&self) -> String {
        match &self.index {
            Some(index) => stats_text(index),
            None => "No index loaded".to_string(),
        }
    }

    #[wasm_bindgen]
    pub fn cleanup(&mut self) {
        self.index = None;
    }
}

impl Default for SwiftAmrEngine {
    fn default() -> Self {
        Self::new()
    }
}
