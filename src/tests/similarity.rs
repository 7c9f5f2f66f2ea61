use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::{embed, fixture, Fixture, DIMS};
use crate::batch::EmbedOptions;
use crate::errors::IndexError;
use crate::provider::HashingProvider;
use crate::semantic::similarity::KeeperReason;

const REPORT: &str = "quarterly sales report for the northern region";

fn set_mtime(path: &Path, secs_ago: u64) {
    let when = SystemTime::now() - Duration::from_secs(secs_ago);
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(when)
        .unwrap();
}

/// Two copies of one report plus an unrelated note, copies aged apart.
fn copies() -> Fixture {
    let fx = fixture(&[
        ("reports/q3.md", REPORT),
        ("reports/old/q3_copy.md", REPORT),
        ("garden.md", "tomatoes and basil along the fence"),
    ]);
    set_mtime(&fx.path("reports/old/q3_copy.md"), 86_400);
    set_mtime(&fx.path("reports/q3.md"), 60);
    fx.rescan();
    fx
}

#[test]
fn test_identical_files_group_without_embeddings() {
    let fx = copies();
    let groups = fx
        .service
        .similarity_groups(&fx.dir, Some(0.99), &HashSet::new())
        .unwrap();

    assert_eq!(groups.len(), 1);
    let group = &groups[0];
    assert_eq!(group.keeper, "reports/q3.md");
    assert_eq!(group.reason, KeeperReason::Newest);
    assert_eq!(group.candidates.len(), 1);
    assert_eq!(group.candidates[0].path, "reports/old/q3_copy.md");
    assert!(group.candidates[0].identical);
    assert!((group.candidates[0].similarity - 1.0).abs() < 1e-6);
}

#[test]
fn test_pinned_copy_wins_over_newer() {
    let fx = copies();
    let pinned: HashSet<String> = ["reports/old/q3_copy.md".to_string()].into();
    let groups = fx.service.similarity_groups(&fx.dir, Some(0.99), &pinned).unwrap();

    assert_eq!(groups[0].keeper, "reports/old/q3_copy.md");
    assert_eq!(groups[0].reason, KeeperReason::Pinned);
    assert_eq!(groups[0].candidates[0].path, "reports/q3.md");
}

#[test]
fn test_unrelated_embedded_files_stay_apart() {
    let fx = copies();
    embed(&fx, Arc::new(HashingProvider::new(DIMS)), &EmbedOptions::default());

    let groups = fx
        .service
        .similarity_groups(&fx.dir, Some(0.99), &HashSet::new())
        .unwrap();
    assert_eq!(groups.len(), 1);
    assert!(groups
        .iter()
        .all(|g| g.keeper != "garden.md" && g.candidates.iter().all(|c| c.path != "garden.md")));
}

#[test]
fn test_propose_moves_targets_archive() {
    let fx = copies();
    let archive = fx.root.path().join("archive");
    let moves = fx
        .service
        .propose_moves(&fx.dir, Some(0.99), &HashSet::new(), &archive)
        .unwrap();

    assert_eq!(moves.len(), 1);
    assert_eq!(moves[0].from, "reports/old/q3_copy.md");
    assert_eq!(moves[0].to, archive.join("reports").join("old").join("q3_copy.md"));
    assert_eq!(moves[0].keeper, "reports/q3.md");
    // advisory only
    assert!(fx.path("reports/old/q3_copy.md").exists());
    assert!(!archive.exists());
}

#[test]
fn test_threshold_out_of_range_is_rejected() {
    let fx = copies();
    let err = fx
        .service
        .similarity_groups(&fx.dir, Some(1.5), &HashSet::new())
        .unwrap_err();
    assert!(matches!(err, IndexError::Config(_)));
}
