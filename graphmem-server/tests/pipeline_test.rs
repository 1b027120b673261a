// Copyright 2025 Graphmem (https://github.com/graphmem)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! End-to-end checks of the pipeline pieces that run without live stores:
//! decoding, extraction chunking and merging, retrieval chunking, the
//! Graph-Guided retrieval arithmetic, and the backup archive format.

use graphmem_core::chunker::SemanticChunker;
use graphmem_core::types::{Chunk, ExtractedEntity, ExtractionResult, ScoredChunk};
use graphmem_server::backup::{combined_checksum, sha256_hex, validate_backup_id};
use graphmem_server::decode::decode_document;
use graphmem_server::extract::{merge_into, split_extraction_chunks};
use graphmem_server::ingest::hash_bytes;
use graphmem_server::query::filter_by_threshold;

#[test]
fn markdown_document_flows_from_decode_to_chunks() {
    let markdown = "\
# Contrat de services

## Article 15 - Résiliation

Le contrat peut être résilié avec un préavis de 30 jours. \
La résiliation doit être notifiée par écrit.

## Article 23 - Réversibilité

Le prestataire s'engage à restituer les données dans un délai de 60 jours.
";
    let text = decode_document(markdown.as_bytes(), "contrat.md").unwrap();
    assert!(text.contains("Résiliation"));
    assert!(!text.contains('#'));

    let chunks = SemanticChunker::new(500, 50).chunk_document(&text, "contrat.md");
    assert!(!chunks.is_empty());
    let total = chunks.len();
    for chunk in &chunks {
        assert_eq!(chunk.total_chunks, total);
        assert!(!chunk.text.trim().is_empty());
        assert_eq!(chunk.filename.as_deref(), Some("contrat.md"));
    }
}

#[test]
fn identical_bytes_hash_identically_distinct_bytes_do_not() {
    let a = "Cloud Temple signe avec Acme le 2024-05-01".as_bytes();
    let b = "Cloud Temple signe avec Acme le 2024-06-01".as_bytes();
    assert_eq!(hash_bytes(a), hash_bytes(a));
    assert_ne!(hash_bytes(a), hash_bytes(b));
    assert_eq!(hash_bytes(a).len(), 64);
}

#[test]
fn extraction_chunking_covers_the_text_without_overlap() {
    let text = "abcdefghij".repeat(1000);
    let chunks = split_extraction_chunks(&text, 2500);
    assert_eq!(chunks.len(), 4);
    assert_eq!(chunks.concat(), text);
}

#[test]
fn cross_chunk_merge_is_idempotent_for_repeated_extractions() {
    let extraction = || ExtractionResult {
        entities: vec![ExtractedEntity {
            name: "Cloud Temple".into(),
            entity_type: "Organization".into(),
            description: Some("Opérateur de cloud".into()),
            aliases: vec![],
            mentions: 1,
        }],
        ..Default::default()
    };

    let mut merged = ExtractionResult::default();
    merge_into(&mut merged, extraction());
    merge_into(&mut merged, extraction());

    assert_eq!(merged.entities.len(), 1);
    assert_eq!(merged.entities[0].mentions, 2);
    // Descriptions dedup by equality: repeated extraction adds nothing.
    assert_eq!(
        merged.entities[0].description.as_deref(),
        Some("Opérateur de cloud")
    );
}

#[test]
fn no_chunk_below_threshold_survives_retrieval() {
    let scored = |score: f32| ScoredChunk {
        chunk: Chunk {
            text: "passage".into(),
            document_id: Some("d".into()),
            ..Default::default()
        },
        score,
    };
    let (retained, _) = filter_by_threshold(
        vec![scored(0.10), scored(0.57), scored(0.58), scored(0.99)],
        0.58,
    );
    assert_eq!(retained.len(), 2);
    assert!(retained.iter().all(|c| c.score >= 0.58));
    // Descending score order is preserved for prompt assembly.
    assert!(retained[0].score >= retained[1].score);
}

#[test]
fn backup_identifiers_and_checksums_hold() {
    let (memory_id, timestamp) = validate_backup_id("legal/20240501T120000Z").unwrap();
    assert_eq!(memory_id, "legal");
    assert_eq!(timestamp, "20240501T120000Z");
    assert!(validate_backup_id("legal/../../x").is_err());

    let checksum = combined_checksum("graph", "vectors", "keys");
    assert_eq!(checksum, combined_checksum("graph", "vectors", "keys"));
    assert_ne!(checksum, combined_checksum("graph", "vectors", "tampered"));

    assert_eq!(sha256_hex(b"").len(), 64);
}
