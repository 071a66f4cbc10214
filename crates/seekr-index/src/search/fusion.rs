//! Rank fusion of semantic hits and keyword matches.

use std::collections::HashMap;

use crate::keyword::KeywordMatch;
use crate::vector_store::ScoredPoint;

/// Reciprocal Rank Fusion.
///
/// Each ranking contributes `weight / (k + rank + 1)` to an id's score.
/// Returns ids by descending fused score; ties keep first-seen order.
pub fn reciprocal_rank_fusion(
    semantic: &[String],
    keyword: &[String],
    k: f32,
    semantic_weight: f32,
    keyword_weight: f32,
) -> Vec<(String, f32)> {
    let mut scores: HashMap<&str, (usize, f32)> = HashMap::new();
    let mut seen = 0usize;

    for (ranking, weight) in [(semantic, semantic_weight), (keyword, keyword_weight)] {
        for (rank, id) in ranking.iter().enumerate() {
            let entry = scores.entry(id.as_str()).or_insert_with(|| {
                seen += 1;
                (seen, 0.0)
            });
            entry.1 += weight / (k + rank as f32 + 1.0);
        }
    }

    let mut fused: Vec<(&str, (usize, f32))> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1 .1
            .partial_cmp(&a.1 .1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1 .0.cmp(&b.1 .0))
    });
    fused
        .into_iter()
        .map(|(id, (_, score))| (id.to_string(), score))
        .collect()
}

/// Count keyword matches falling inside each hit's line range.
pub fn keyword_hits_per_point(hits: &[ScoredPoint], matches: &[KeywordMatch]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for hit in hits {
        let n = matches
            .iter()
            .filter(|m| {
                m.file_path == hit.payload.file_path
                    && m.line >= hit.payload.start_line
                    && m.line <= hit.payload.end_line
            })
            .count();
        if n > 0 {
            counts.insert(hit.id.clone(), n);
        }
    }
    counts
}

/// Keyword matches in a file that no semantic hit covers, grouped into one
/// candidate so grep-only files still reach the fused ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordCandidate {
    pub id: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    /// Matching lines in line order
    pub lines: Vec<String>,
}

fn covered(hits: &[ScoredPoint], m: &KeywordMatch) -> bool {
    hits.iter().any(|hit| {
        m.file_path == hit.payload.file_path
            && m.line >= hit.payload.start_line
            && m.line <= hit.payload.end_line
    })
}

/// Group uncovered matches by file, in order of each file's first match.
pub fn keyword_only_candidates(hits: &[ScoredPoint], matches: &[KeywordMatch]) -> Vec<KeywordCandidate> {
    let mut candidates: Vec<KeywordCandidate> = Vec::new();
    let mut lines: HashMap<&str, Vec<(usize, &str)>> = HashMap::new();

    for m in matches.iter().filter(|m| !covered(hits, m)) {
        let entry = lines.entry(m.file_path.as_str()).or_default();
        if entry.is_empty() {
            candidates.push(KeywordCandidate {
                id: format!("keyword:{}", m.file_path),
                file_path: m.file_path.clone(),
                start_line: m.line,
                end_line: m.line,
                lines: Vec::new(),
            });
        }
        entry.push((m.line, m.text.as_str()));
    }

    for candidate in &mut candidates {
        if let Some(found) = lines.get_mut(candidate.file_path.as_str()) {
            found.sort_by_key(|(line, _)| *line);
            found.dedup_by_key(|(line, _)| *line);
            candidate.start_line = found.first().map(|(l, _)| *l).unwrap_or(candidate.start_line);
            candidate.end_line = found.last().map(|(l, _)| *l).unwrap_or(candidate.end_line);
            candidate.lines = found.iter().map(|(_, text)| text.to_string()).collect();
        }
    }
    candidates
}

/// Keyword ranking over semantic hits with matches and keyword-only
/// candidates: most matches first, then semantic order, then first match.
pub fn keyword_ranking(
    hits: &[ScoredPoint],
    counts: &HashMap<String, usize>,
    candidates: &[KeywordCandidate],
) -> Vec<String> {
    let mut ranked: Vec<(usize, usize, &str)> = hits
        .iter()
        .enumerate()
        .filter_map(|(pos, hit)| counts.get(&hit.id).map(|n| (*n, pos, hit.id.as_str())))
        .collect();
    ranked.extend(
        candidates
            .iter()
            .enumerate()
            .map(|(pos, c)| (c.lines.len(), hits.len() + pos, c.id.as_str())),
    );
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    ranked.into_iter().map(|(_, _, id)| id.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::filter::path_segments;
    use crate::vector_store::SegmentPayload;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn hit(id: &str, path: &str, start: usize, end: usize) -> ScoredPoint {
        ScoredPoint {
            id: id.to_string(),
            score: 0.5,
            payload: SegmentPayload {
                file_path: path.to_string(),
                identifier: None,
                kind: "function".to_string(),
                start_line: start,
                end_line: end,
                code_chunk: String::new(),
                segment_hash: id.to_string(),
                path_segments: path_segments(path),
            },
        }
    }

    fn matched(path: &str, line: usize) -> KeywordMatch {
        KeywordMatch {
            file_path: path.to_string(),
            line,
            text: String::new(),
        }
    }

    #[test]
    fn test_rrf_fusion() {
        let fused = reciprocal_rank_fusion(
            &ids(&["doc1", "doc2", "doc3"]),
            &ids(&["doc2", "doc1", "doc4"]),
            60.0,
            0.7,
            0.3,
        );
        let top_two: Vec<&str> = fused.iter().take(2).map(|(id, _)| id.as_str()).collect();
        assert!(top_two.contains(&"doc1"));
        assert!(top_two.contains(&"doc2"));
        assert_eq!(fused.len(), 4);
    }

    #[test]
    fn test_rrf_single_source_keeps_order() {
        let fused = reciprocal_rank_fusion(&ids(&["doc1", "doc2"]), &[], 60.0, 0.7, 0.3);
        assert_eq!(fused[0].0, "doc1");
        assert_eq!(fused[1].0, "doc2");
    }

    #[test]
    fn test_rrf_equal_weights_tie_on_first_seen() {
        let fused = reciprocal_rank_fusion(&ids(&["doc1"]), &ids(&["doc2"]), 60.0, 0.5, 0.5);
        assert!((fused[0].1 - fused[1].1).abs() < f32::EPSILON);
        assert_eq!(fused[0].0, "doc1");
    }

    #[test]
    fn test_rrf_k_parameter_effect() {
        let ranking = ids(&["doc1", "doc2"]);
        let low = reciprocal_rank_fusion(&ranking, &[], 10.0, 1.0, 0.0);
        let high = reciprocal_rank_fusion(&ranking, &[], 100.0, 1.0, 0.0);
        assert!(low[0].1 - low[1].1 > high[0].1 - high[1].1);
    }

    #[test]
    fn test_keyword_matches_map_to_line_ranges() {
        let hits = vec![hit("p1", "src/a.rs", 1, 10), hit("p2", "src/a.rs", 11, 20), hit("p3", "src/b.rs", 1, 5)];
        let matches = vec![
            matched("src/a.rs", 12),
            matched("src/a.rs", 15),
            matched("src/a.rs", 3),
            matched("src/c.rs", 1),
        ];
        let counts = keyword_hits_per_point(&hits, &matches);
        assert_eq!(counts.get("p1"), Some(&1));
        assert_eq!(counts.get("p2"), Some(&2));
        assert!(!counts.contains_key("p3"));

        assert_eq!(keyword_ranking(&hits, &counts, &[]), vec!["p2", "p1"]);
    }

    #[test]
    fn test_uncovered_matches_become_candidates() {
        let hits = vec![hit("p1", "src/a.rs", 1, 10)];
        let matches = vec![
            matched("src/grep_only.rs", 30),
            matched("src/a.rs", 4),
            matched("src/a.rs", 40),
            matched("src/grep_only.rs", 7),
            matched("src/grep_only.rs", 7),
        ];
        let candidates = keyword_only_candidates(&hits, &matches);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].file_path, "src/grep_only.rs");
        assert_eq!((candidates[0].start_line, candidates[0].end_line), (7, 30));
        assert_eq!(candidates[0].lines.len(), 2);
        assert_eq!(candidates[1].file_path, "src/a.rs");
        assert_eq!((candidates[1].start_line, candidates[1].end_line), (40, 40));

        let counts = keyword_hits_per_point(&hits, &matches);
        let ranking = keyword_ranking(&hits, &counts, &candidates);
        assert_eq!(ranking, vec!["keyword:src/grep_only.rs", "p1", "keyword:src/a.rs"]);
    }
}
