use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{embed, fixture, set_parallelism, CountingProvider, Fixture};
use crate::batch::{BatchStatus, EmbedOptions};
use crate::errors::IndexError;
use crate::provider::{EmbeddingProvider, HashingProvider};

fn ten_files() -> Fixture {
    let files: Vec<(String, String)> = (0..10)
        .map(|i| (format!("note_{i:02}.md"), format!("note number {i} about topic {i}")))
        .collect();
    let refs: Vec<(&str, &str)> = files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
    let fx = fixture(&refs);
    set_parallelism(&fx.dir, 1);
    fx
}

#[test]
fn test_cancel_then_resume_embeds_each_file_once() {
    let fx = ten_files();
    let options = EmbedOptions {
        max_files: None,
        batch_size: Some(2),
    };

    let first = Arc::new(CountingProvider::cancelling_after(2, &fx.dir));
    let cancelled = embed(&fx, first.clone(), &options);
    assert_eq!(cancelled.status, BatchStatus::Cancelled);
    assert_eq!(cancelled.total_batches, 5);
    assert_eq!(cancelled.embedded_files, 4);
    assert_eq!(first.calls.load(Ordering::SeqCst), 2);
    assert!(!fx.dir.join("cancel.flag").exists());

    let second = Arc::new(CountingProvider::new());
    let resumed = embed(&fx, second.clone(), &options);
    assert_eq!(resumed.status, BatchStatus::Complete);
    assert_eq!(resumed.total_files, 6);
    assert_eq!(second.calls.load(Ordering::SeqCst), 3);

    // five batches in total and no input sent twice
    let mut all = first.seen();
    all.extend(second.seen());
    assert_eq!(all.len(), 10);
    assert_eq!(all.iter().collect::<HashSet<_>>().len(), 10);
    assert_eq!(fx.service.get_stats(&fx.dir).unwrap().embedding_count, 10);
}

#[test]
fn test_max_files_limits_one_run() {
    let fx = ten_files();
    let provider = Arc::new(CountingProvider::new());

    let done = embed(
        &fx,
        provider.clone(),
        &EmbedOptions {
            max_files: Some(3),
            batch_size: None,
        },
    );
    assert_eq!(done.status, BatchStatus::Complete);
    assert_eq!(done.embedded_files, 3);

    let rest = embed(&fx, provider.clone(), &EmbedOptions::default());
    assert_eq!(rest.embedded_files, 7);
    assert_eq!(provider.seen().len(), 10);
}

#[test]
fn test_nothing_left_completes_immediately() {
    let fx = ten_files();
    let provider = Arc::new(CountingProvider::new());
    embed(&fx, provider.clone(), &EmbedOptions::default());

    let again = embed(&fx, provider.clone(), &EmbedOptions::default());
    assert_eq!(again.status, BatchStatus::Complete);
    assert_eq!(again.total_files, 0);
    assert_eq!(provider.seen().len(), 10);
}

#[test]
fn test_dimension_mismatch_rejected_before_start() {
    let fx = ten_files();
    embed(&fx, Arc::new(CountingProvider::new()), &EmbedOptions::default());

    // same provider and model name, different width
    struct Wider(HashingProvider);
    impl EmbeddingProvider for Wider {
        fn id(&self) -> &str {
            "hashing"
        }
        fn model(&self) -> &str {
            "hash-64"
        }
        fn dimensions(&self) -> usize {
            self.0.dimensions()
        }
        fn max_batch_size(&self) -> usize {
            8
        }
        fn embed(
            &self,
            inputs: &[String],
        ) -> Result<Vec<Vec<f32>>, crate::provider::ProviderError> {
            self.0.embed(inputs)
        }
    }

    let result = fx.service.start_embedding_with(
        &fx.dir,
        Arc::new(Wider(HashingProvider::new(128))),
        &EmbedOptions::default(),
    );
    assert!(matches!(result, Err(IndexError::Config(_))));
}

#[test]
fn test_zero_batch_size_rejected() {
    let fx = ten_files();
    let result = fx.service.start_embedding_with(
        &fx.dir,
        Arc::new(CountingProvider::new()),
        &EmbedOptions {
            max_files: None,
            batch_size: Some(0),
        },
    );
    assert!(matches!(result, Err(IndexError::Config(_))));
}

#[test]
fn test_progress_persists_after_run() {
    let fx = ten_files();
    embed(&fx, Arc::new(CountingProvider::new()), &EmbedOptions::default());

    let progress = fx.service.progress(&fx.dir).unwrap().unwrap();
    assert_eq!(progress.status, BatchStatus::Complete);
    assert_eq!(progress.processed_files, 10);
    assert!(progress.finished_at.is_some());
    assert!(!fx.service.cancel_embedding(&fx.dir).unwrap());
}
