use proptest::prelude::*;
use swiftamr_core::{decode_kmer, encode_kmer};

proptest! {
    // Lightweight property tests for the 2-bit codec.
    #[test]
    fn prop_encode_decode_roundtrip(
        bases in prop::collection::vec(prop::sample::select(b"ACGTacgt".to_vec()), 16)
    ) {
        let code = encode_kmer(&bases).unwrap();
        prop_assert_eq!(decode_kmer(code).to_vec(), bases.to_ascii_uppercase());
    }

    #[test]
    fn prop_ambiguous_window_rejected(
        pos in 0usize..16,
        bad in prop::sample::select(b"NRYKMnxu-. 0".to_vec())
    ) {
        let mut bases = *b"ACGTACGTACGTACGT";
        bases[pos] = bad;
        prop_assert!(encode_kmer(&bases).is_none());
    }
}
