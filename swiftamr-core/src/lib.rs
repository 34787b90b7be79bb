//! K-mer alignment engine for antimicrobial-resistance gene detection.
//!
//! A [`KmerIndex`] is built once from a reference FASTA held in memory;
//! FASTQ reads are then assigned to at most one gene each by a
//! winner-takes-all vote over exact 16-mer matches. Matching is
//! forward-strand only: callers that need the opposite strand must
//! reverse-complement their input before alignment.

use std::collections::TryReserveError;
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Clone, Copy)]
pub struct Config {
    pub kmer_size: usize,
    pub hash_table_size: usize,
    pub max_gene_name: usize,
    pub max_sequence_length: usize,
    pub initial_gene_capacity: usize,
    pub initial_hit_capacity: usize,
}

pub const CONFIG: Config = Config {
    kmer_size: 16,
    hash_table_size: 1 << 24,
    max_gene_name: 256,
    max_sequence_length: 100 * 1024 * 1024,
    initial_gene_capacity: 1024,
    initial_hit_capacity: 4,
};

const K: usize = CONFIG.kmer_size;
const MAX_NAME: usize = CONFIG.max_gene_name - 1;

const BASE_LUT: [i8; 256] = {
    let mut lut = [-1i8; 256];
    lut[b'A' as usize] = 0;
    lut[b'a' as usize] = 0;
    lut[b'C' as usize] = 1;
    lut[b'c' as usize] = 1;
    lut[b'G' as usize] = 2;
    lut[b'g' as usize] = 2;
    lut[b'T' as usize] = 3;
    lut[b't' as usize] = 3;
    lut
};

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("input buffer is empty")]
    EmptyInput,
    #[error("no FASTA records found in input")]
    NoRecords,
    #[error("sequence for {name:?} exceeds {limit} bytes")]
    SequenceTooLong { name: String, limit: usize },
    #[error("no index loaded")]
    NoIndex,
    #[error("out of memory: {0}")]
    OutOfMemory(#[from] TryReserveError),
}

#[inline(always)]
fn base_to_code(b: u8) -> Option<u32> {
    let v = BASE_LUT[b as usize];
    if v >= 0 {
        Some(v as u32)
    } else {
        None
    }
}

/// Encode a 16-base window as 2 bits per base, first base in the
/// most significant pair. `None` if the window is not exactly K bases
/// of `{A,C,G,T,a,c,g,t}`.
#[inline]
pub fn encode_kmer(window: &[u8]) -> Option<u32> {
    if window.len() != K {
        return None;
    }
    let mut code = 0u32;
    for &b in window {
        code = (code << 2) | base_to_code(b)?;
    }
    Some(code)
}

/// Inverse of [`encode_kmer`]; always uppercase.
#[inline]
pub fn decode_kmer(code: u32) -> [u8; K] {
    const NT: [u8; 4] = *b"ACGT";
    let mut out = [0u8; K];
    for (i, slot) in out.iter_mut().enumerate() {
        let shift = 2 * (K - 1 - i);
        *slot = NT[((code >> shift) & 0b11) as usize];
    }
    out
}

fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_NAME {
        return name.to_string();
    }
    let mut end = MAX_NAME;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// One reference sequence. `sequence` is stored uppercase.
#[derive(Debug)]
pub struct Gene {
    pub name: String,
    pub sequence: Vec<u8>,
}

impl Gene {
    #[inline]
    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KmerHit {
    pub gene_id: u32,
    pub position: u32,
}

/// All hits for one distinct k-mer value; the full code is kept so a
/// bucket traversal compares codes instead of rehashing.
#[derive(Debug)]
pub struct KmerEntry {
    pub kmer: u32,
    pub hits: Vec<KmerHit>,
}

#[derive(Debug)]
pub struct KmerIndex {
    buckets: Vec<Vec<KmerEntry>>,
    genes: Vec<Gene>,
    distinct_kmers: u64,
    total_hits: u64,
}

impl KmerIndex {
    /// Allocate an empty index: a fixed table of 2^24 chained buckets
    /// and a gene table that grows from 1024 entries by doubling.
    pub fn create() -> Result<Self> {
        let mut buckets = Vec::new();
        buckets.try_reserve_exact(CONFIG.hash_table_size)?;
        buckets.resize_with(CONFIG.hash_table_size, Vec::new);
        let mut genes = Vec::new();
        genes.try_reserve(CONFIG.initial_gene_capacity)?;
        Ok(KmerIndex {
            buckets,
            genes,
            distinct_kmers: 0,
            total_hits: 0,
        })
    }

    /// Parse `data` as FASTA and index every record. Record headers
    /// start with `>` at the beginning of a line; names are the header
    /// text up to the first `\r`/`\n`, truncated to 255 bytes; records
    /// with an empty sequence are dropped.
    pub fn build_from_fasta(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(EngineError::EmptyInput);
        }
        let mut index = Self::create()?;
        let mut saw_record = false;
        let records = FastaRecords { data, pos: 0 };
        for (name, seq) in records {
            saw_record = true;
            if seq.is_empty() {
                continue;
            }
            index.add_gene(&name, &seq)?;
        }
        if !saw_record {
            return Err(EngineError::NoRecords);
        }
        eprintln!("Indexing statistics:");
        eprintln!("  Genes indexed: {}", index.genes.len());
        eprintln!("  Distinct k-mers: {}", index.distinct_kmers);
        eprintln!("  Total k-mer hits: {}", index.total_hits);
        Ok(index)
    }

    /// Append one gene and index every valid k-mer window of its
    /// sequence. The name is truncated to 255 bytes, the sequence is
    /// stored uppercase. Returns the dense id assigned to the gene.
    pub fn add_gene(&mut self, name: &str, sequence: &[u8]) -> Result<u32> {
        if sequence.len() > CONFIG.max_sequence_length {
            return Err(EngineError::SequenceTooLong {
                name: truncate_name(name),
                limit: CONFIG.max_sequence_length,
            });
        }
        let gene_id = self.genes.len() as u32;
        let sequence = sequence.to_ascii_uppercase();
        for (pos, window) in sequence.windows(K).enumerate() {
            if let Some(code) = encode_kmer(window) {
                self.insert(code, gene_id, pos as u32);
            }
        }
        self.genes.push(Gene {
            name: truncate_name(name),
            sequence,
        });
        Ok(gene_id)
    }

    fn insert(&mut self, kmer: u32, gene_id: u32, position: u32) {
        let bucket = kmer as usize % self.buckets.len();
        let chain = &mut self.buckets[bucket];
        match chain.iter_mut().find(|e| e.kmer == kmer) {
            Some(entry) => entry.hits.push(KmerHit { gene_id, position }),
            None => {
                let mut hits = Vec::with_capacity(CONFIG.initial_hit_capacity);
                hits.push(KmerHit { gene_id, position });
                chain.push(KmerEntry { kmer, hits });
                self.distinct_kmers += 1;
            }
        }
        self.total_hits += 1;
    }

    /// The chain node for `kmer`, or `None` if it was never indexed.
    #[inline]
    pub fn lookup(&self, kmer: u32) -> Option<&KmerEntry> {
        self.buckets[kmer as usize % self.buckets.len()]
            .iter()
            .find(|e| e.kmer == kmer)
    }

    #[inline]
    pub fn num_genes(&self) -> usize {
        self.genes.len()
    }

    #[inline]
    pub fn gene(&self, id: u32) -> &Gene {
        &self.genes[id as usize]
    }

    #[inline]
    pub fn genes(&self) -> &[Gene] {
        &self.genes
    }

    #[inline]
    pub fn distinct_kmers(&self) -> u64 {
        self.distinct_kmers
    }

    #[inline]
    pub fn total_hits(&self) -> u64 {
        self.total_hits
    }

    #[inline]
    pub fn table_size(&self) -> usize {
        self.buckets.len()
    }
}

struct FastaRecords<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Iterator for FastaRecords<'_> {
    type Item = (String, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let data = self.data;
        // A '>' opens a record only at file start or right after '\n',
        // so a '>' inside a header or a sequence line never splits.
        while self.pos < data.len() {
            if data[self.pos] == b'>' && (self.pos == 0 || data[self.pos - 1] == b'\n') {
                break;
            }
            self.pos += 1;
        }
        if self.pos >= data.len() {
            return None;
        }

        let mut i = self.pos + 1;
        let name_start = i;
        while i < data.len() && data[i] != b'\n' && data[i] != b'\r' {
            i += 1;
        }
        let name = String::from_utf8_lossy(&data[name_start..i]).into_owned();
        while i < data.len() && data[i] != b'\n' {
            i += 1;
        }
        if i < data.len() {
            i += 1;
        }

        let mut seq = Vec::new();
        while i < data.len() {
            if data[i] == b'>' && data[i - 1] == b'\n' {
                break;
            }
            let c = data[i];
            if !c.is_ascii_whitespace() {
                seq.push(c.to_ascii_uppercase());
            }
            i += 1;
        }
        self.pos = i;
        Some((name, seq))
    }
}

pub struct FastqRecord {
    pub name: String,
    pub seq: Vec<u8>,
}

pub struct FastqRecords<'a> {
    data: &'a [u8],
    pos: usize,
}

/// Iterate the four-line records of a FASTQ byte buffer. Sequence and
/// quality lines may be soft-wrapped; quality bytes are consumed by
/// count, so a quality line that happens to begin with `@` is never
/// taken for a header. Malformed trailing records are dropped.
pub fn fastq_records(data: &[u8]) -> FastqRecords<'_> {
    FastqRecords { data, pos: 0 }
}

impl Iterator for FastqRecords<'_> {
    type Item = FastqRecord;

    fn next(&mut self) -> Option<FastqRecord> {
        let data = self.data;
        loop {
            while self.pos < data.len() {
                if data[self.pos] == b'@' && (self.pos == 0 || data[self.pos - 1] == b'\n') {
                    break;
                }
                self.pos += 1;
            }
            if self.pos >= data.len() {
                return None;
            }

            // Name: the non-whitespace run after '@', capped at 255 bytes.
            let mut i = self.pos + 1;
            let name_start = i;
            while i < data.len() && !data[i].is_ascii_whitespace() {
                i += 1;
            }
            let name_end = i.min(name_start + MAX_NAME);
            let name = String::from_utf8_lossy(&data[name_start..name_end]).into_owned();
            while i < data.len() && data[i] != b'\n' {
                i += 1;
            }
            if i >= data.len() {
                self.pos = i;
                return None;
            }
            i += 1;

            // Sequence lines run until the '+' separator line.
            let mut seq = Vec::new();
            let mut have_sep = false;
            while i < data.len() {
                if data[i] == b'+' {
                    have_sep = true;
                    break;
                }
                while i < data.len() && data[i] != b'\n' {
                    let c = data[i];
                    if !c.is_ascii_whitespace() {
                        seq.push(c.to_ascii_uppercase());
                    }
                    i += 1;
                }
                if i < data.len() {
                    i += 1;
                }
            }
            if !have_sep {
                self.pos = i;
                return None;
            }
            while i < data.len() && data[i] != b'\n' {
                i += 1;
            }
            if i < data.len() {
                i += 1;
            }

            // Quality is discarded, but must be walked past by byte
            // count so record scanning resumes at the right offset.
            let mut qual_seen = 0usize;
            while i < data.len() && qual_seen < seq.len() {
                if !data[i].is_ascii_whitespace() {
                    qual_seen += 1;
                }
                i += 1;
            }
            while i < data.len() && data[i] != b'\n' {
                i += 1;
            }
            if i < data.len() {
                i += 1;
            }
            self.pos = i;

            if seq.len() > CONFIG.max_sequence_length {
                continue;
            }
            return Some(FastqRecord { name, seq });
        }
    }
}

/// Result for one read. `best_gene` is `None` when no k-mer of the
/// read matched any indexed gene.
#[derive(Clone, Debug)]
pub struct ReadAlignment {
    pub read_name: String,
    pub best_gene: Option<u32>,
    pub score: u32,
    pub coverage: f32,
    pub identity: f32,
    pub total_kmers: u32,
}

/// Per-read scratch, reusable across a batch. Scores and hit position
/// lists are reset between reads by walking only the touched genes.
pub struct State {
    scores: Vec<u32>,
    touched: Vec<u32>,
    positions: Vec<Vec<u32>>,
    cover: Vec<u64>,
}

impl State {
    pub fn new() -> Self {
        Self {
            scores: Vec::new(),
            touched: Vec::with_capacity(64),
            positions: Vec::new(),
            cover: Vec::new(),
        }
    }

    fn prepare(&mut self, num_genes: usize) -> Result<()> {
        if self.scores.len() < num_genes {
            self.scores.try_reserve(num_genes - self.scores.len())?;
            self.scores.resize(num_genes, 0);
            self.positions.try_reserve(num_genes - self.positions.len())?;
            self.positions.resize_with(num_genes, Vec::new);
        }
        Ok(())
    }

    fn reset(&mut self) {
        for &g in &self.touched {
            self.scores[g as usize] = 0;
            self.positions[g as usize].clear();
        }
        self.touched.clear();
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Align one read against the index. Reads shorter than K produce
/// nothing; every other read produces exactly one [`ReadAlignment`],
/// no-hit reads included. Every (gene, position) hit of a matching
/// window adds one to that gene's score and records the position; the
/// gene with the highest score wins, ties going to the smallest id.
pub fn align_read(
    index: &KmerIndex,
    name: &str,
    seq: &[u8],
    state: &mut State,
) -> Result<Option<ReadAlignment>> {
    if seq.len() < K {
        return Ok(None);
    }
    state.prepare(index.num_genes())?;

    let mut total_kmers = 0u32;
    for window in seq.windows(K) {
        let Some(code) = encode_kmer(window) else {
            continue;
        };
        total_kmers += 1;
        let Some(entry) = index.lookup(code) else {
            continue;
        };
        for hit in &entry.hits {
            let g = hit.gene_id as usize;
            if state.scores[g] == 0 {
                state.touched.push(hit.gene_id);
            }
            state.scores[g] += 1;
            state.positions[g].push(hit.position);
        }
    }

    let mut best: Option<(u32, u32)> = None;
    for &g in &state.touched {
        let s = state.scores[g as usize];
        match best {
            Some((bg, bs)) if s < bs || (s == bs && g >= bg) => {}
            _ => best = Some((g, s)),
        }
    }

    let aln = match best {
        None => ReadAlignment {
            read_name: name.to_string(),
            best_gene: None,
            score: 0,
            coverage: 0.0,
            identity: 0.0,
            total_kmers,
        },
        Some((g, score)) => {
            let gene_len = index.gene(g).len();
            let words = (gene_len + 63) / 64;
            state.cover.clear();
            state.cover.resize(words, 0);
            for &p in &state.positions[g as usize] {
                let p = p as usize;
                if p < gene_len {
                    state.cover[p / 64] |= 1u64 << (p % 64);
                }
            }
            let covered: u32 = state.cover.iter().map(|w| w.count_ones()).sum();
            let max_possible = (gene_len.min(seq.len()) - K + 1) as u32;
            ReadAlignment {
                read_name: name.to_string(),
                best_gene: Some(g),
                score,
                coverage: covered as f32 / gene_len as f32,
                identity: (score as f32 / max_possible as f32).min(1.0),
                total_kmers,
            }
        }
    };
    state.reset();
    Ok(Some(aln))
}

/// Align every read of a FASTQ byte buffer, in input order. Reads
/// shorter than K and malformed records are skipped without a result.
pub fn align_batch(index: &KmerIndex, fastq: &[u8]) -> Result<Vec<ReadAlignment>> {
    let mut state = State::new();
    let mut results = Vec::new();
    for record in fastq_records(fastq) {
        if let Some(aln) = align_read(index, &record.name, &record.seq, &mut state)? {
            results.push(aln);
        }
    }
    Ok(results)
}

/// Serialize a batch as the TSV report: one header row, then one row
/// per aligned read with `No_hit` for reads that matched nothing.
pub fn write_tsv(index: &KmerIndex, batch: &[ReadAlignment]) -> String {
    let mut out = String::with_capacity(64 + batch.len() * 64);
    out.push_str("read_name\tgene\tscore\tcoverage\tidentity\n");
    for aln in batch {
        let gene_name = match aln.best_gene {
            Some(g) => index.gene(g).name.as_str(),
            None => "No_hit",
        };
        let _ = writeln!(
            out,
            "{}\t{}\t{}\t{:.4}\t{:.4}",
            aln.read_name, gene_name, aln.score, aln.coverage, aln.identity
        );
    }
    out
}

pub fn stats_text(index: &KmerIndex) -> String {
    format!(
        "Index Statistics:\n  Number of genes: {}\n  K-mer size: {}\n  Hash table size: {}\n",
        index.num_genes(),
        K,
        index.table_size()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_known_value() {
        // A=00 C=01 G=10 T=11, big-endian pairs.
        assert_eq!(encode_kmer(b"ACGTACGTACGTACGT"), Some(0x1B1B_1B1B));
        assert_eq!(encode_kmer(b"acgtacgtacgtacgt"), Some(0x1B1B_1B1B));
        assert_eq!(encode_kmer(b"AAAAAAAAAAAAAAAA"), Some(0));
        assert_eq!(encode_kmer(b"TTTTTTTTTTTTTTTT"), Some(u32::MAX));
    }

    #[test]
    fn encode_rejects_ambiguity_and_length() {
        assert_eq!(encode_kmer(b"ACGTACGTNCGTACGT"), None);
        assert_eq!(encode_kmer(b"ACGT ACGTACGTACG"), None);
        assert_eq!(encode_kmer(b"ACGTACGTACGTACG"), None);
        assert_eq!(encode_kmer(b"ACGTACGTACGTACGTA"), None);
    }

    #[test]
    fn decode_round_trip() {
        assert_eq!(&decode_kmer(0x1B1B_1B1B), b"ACGTACGTACGTACGT");
        assert_eq!(&decode_kmer(0), b"AAAAAAAAAAAAAAAA");
    }

    #[test]
    fn bucket_chains_keep_codes_apart() {
        let mut index = KmerIndex::create().unwrap();
        // Differ only above bit 24: same bucket, distinct entries.
        let a = 0x0000_0042u32;
        let b = 0x0100_0042u32;
        index.insert(a, 0, 7);
        index.insert(b, 1, 9);
        index.insert(a, 2, 3);

        let ea = index.lookup(a).unwrap();
        assert_eq!(ea.kmer, a);
        assert_eq!(
            ea.hits,
            vec![
                KmerHit { gene_id: 0, position: 7 },
                KmerHit { gene_id: 2, position: 3 }
            ]
        );
        let eb = index.lookup(b).unwrap();
        assert_eq!(eb.kmer, b);
        assert_eq!(eb.hits, vec![KmerHit { gene_id: 1, position: 9 }]);
        assert!(index.lookup(0x0200_0042).is_none());
        assert_eq!(index.distinct_kmers(), 2);
        assert_eq!(index.total_hits(), 3);
    }

    #[test]
    fn fasta_records_split_at_line_start_only() {
        let data = b">gene>one\nACGT\nacgt\n>two\r\nGGGG\n";
        let recs: Vec<_> = FastaRecords { data, pos: 0 }.collect();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].0, "gene>one");
        assert_eq!(recs[0].1, b"ACGTACGT");
        assert_eq!(recs[1].0, "two");
        assert_eq!(recs[1].1, b"GGGG");
    }

    #[test]
    fn fasta_leading_junk_is_ignored() {
        let data = b"; comment\n>g\nACGT\n";
        let recs: Vec<_> = FastaRecords { data, pos: 0 }.collect();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].0, "g");
    }

    #[test]
    fn gene_name_is_truncated() {
        let mut index = KmerIndex::create().unwrap();
        let long = "x".repeat(400);
        let id = index.add_gene(&long, b"ACGT").unwrap();
        assert_eq!(index.gene(id).name.len(), 255);
    }

    #[test]
    fn fastq_quality_starting_with_at_is_not_a_header() {
        let data = b"@r1\nGATTACAGATTACAGATTAC\n+\n@IIIIIIIIIIIIIIIIIII\n@r2 desc\nACGTACGTACGTACGT\n+r2\nIIIIIIIIIIIIIIII\n";
        let recs: Vec<_> = fastq_records(data).collect();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].name, "r1");
        assert_eq!(recs[0].seq, b"GATTACAGATTACAGATTAC");
        assert_eq!(recs[1].name, "r2");
        assert_eq!(recs[1].seq, b"ACGTACGTACGTACGT");
    }

    #[test]
    fn fastq_wrapped_sequence_and_quality() {
        let data = b"@r\nACGTACGT\nACGTACGT\n+\nIIIIIIII\nIIIIIIII\n@s\nTTTTTTTTTTTTTTTT\n+\nJJJJJJJJJJJJJJJJ\n";
        let recs: Vec<_> = fastq_records(data).collect();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].seq, b"ACGTACGTACGTACGT");
        assert_eq!(recs[1].name, "s");
    }

    #[test]
    fn fastq_lowercase_is_folded() {
        let data = b"@r\nacgtacgtacgtacgt\n+\nIIIIIIIIIIIIIIII\n";
        let recs: Vec<_> = fastq_records(data).collect();
        assert_eq!(recs[0].seq, b"ACGTACGTACGTACGT");
    }

    #[test]
    fn fastq_truncated_record_is_dropped() {
        let data = b"@r1\nACGTACGTACGTACGT\n+\nIIIIIIIIIIIIIIII\n@r2\nACGT";
        let recs: Vec<_> = fastq_records(data).collect();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].name, "r1");
    }
}
