use finrag_core::{ChunkConfig, Chunker, Document};
use proptest::prelude::*;

proptest! {
    #[test]
    fn chunks_never_exceed_chunk_size((size, overlap) in sizes(), text in filing_text()) {
        let chunker = Chunker::new(ChunkConfig::new(size, overlap)).expect("config");
        for chunk in chunker.split(&text) {
            prop_assert!(chunk.chars().count() <= size);
            prop_assert!(!chunk.trim().is_empty());
        }
    }

    #[test]
    fn splitting_is_deterministic((size, overlap) in sizes(), text in filing_text()) {
        let chunker = Chunker::new(ChunkConfig::new(size, overlap)).expect("config");
        prop_assert_eq!(chunker.split(&text), chunker.split(&text));
    }

    #[test]
    fn consecutive_chunks_share_at_most_the_overlap(
        (size, overlap) in (10usize..80).prop_flat_map(|size| (Just(size), 0..=size.min(12))),
        words in 1usize..200,
    ) {
        // distinct words, so any repeated text at a boundary is carried overlap
        let text = (0..words).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let chunker = Chunker::new(ChunkConfig::new(size, overlap)).expect("config");
        let chunks = chunker.split(&text);
        if text.chars().count() > size {
            prop_assert!(chunks.len() > 1);
        }
        for pair in chunks.windows(2) {
            let shared = shared_boundary(&pair[0], &pair[1]);
            prop_assert!(shared <= overlap, "{:?} / {:?} share {} chars", pair[0], pair[1], shared);
        }
    }

    #[test]
    fn chunk_index_is_contiguous_per_document(bodies in prop::collection::vec(non_blank_text(), 1..5)) {
        let chunker = Chunker::new(ChunkConfig::new(40, 8)).expect("config");
        let docs: Vec<Document> = bodies
            .iter()
            .enumerate()
            .map(|(i, body)| Document::new(body.clone(), format!("T{i}"), "2023-01-01", format!("doc{i}.txt")))
            .collect();
        let chunks = chunker.split_documents(&docs);
        prop_assert!(chunks.len() >= docs.len());
        for doc in &docs {
            let indices: Vec<usize> = chunks
                .iter()
                .filter(|c| c.ticker == doc.ticker)
                .map(|c| c.chunk_index)
                .collect();
            prop_assert!(!indices.is_empty());
            prop_assert_eq!(indices, (0..chunks.iter().filter(|c| c.ticker == doc.ticker).count()).collect::<Vec<_>>());
        }
    }
}

// Longest suffix of `left` that is also a prefix of `right`, in chars.
fn shared_boundary(left: &str, right: &str) -> usize {
    right
        .char_indices()
        .map(|(idx, ch)| idx + ch.len_utf8())
        .filter(|&end| left.ends_with(&right[..end]))
        .map(|end| right[..end].chars().count())
        .max()
        .unwrap_or(0)
}

fn sizes() -> impl Strategy<Value = (usize, usize)> {
    (1usize..120).prop_flat_map(|size| (Just(size), 0..=size))
}

fn filing_text() -> impl Strategy<Value = String> {
    "[A-Za-z0-9 $.,%\n]{0,400}".prop_map(|s| s.to_string())
}

fn non_blank_text() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9 .\n]{0,200}".prop_map(|s| s.to_string())
}
