//! End-to-end ingest + drain behaviour over the in-memory collaborators.

use std::collections::BTreeMap;
use std::time::Duration;

use cody_core::{
    ActionKind, ActionQueue, BlobStore, CommitEvent, CommitId, Notifier, ObjectLocation,
    PublishState, PublishTarget, PublisherConfig, StalePolicy, StatusKey, StatusStore,
};
use cody_publish::{
    memory::DequeueOrder, run_trampoline, DrainOutcome, DrainReport, IngestOutcome,
    MemoryBackends, MemoryQueue, PublishError, Publisher, DRAIN_TRIGGER,
};
use rstest::rstest;

const REPO: &str = "site";
const BRANCH: &str = "main";

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    memory: MemoryBackends,
    publisher: Publisher,
}

impl Harness {
    fn new() -> Self {
        Self::with(PublisherConfig::default(), MemoryQueue::default())
    }

    fn with(config: PublisherConfig, queue: MemoryQueue) -> Self {
        let memory = MemoryBackends::with_queue(queue);
        let publisher = Publisher::new(memory.backends(), &config);
        Self { memory, publisher }
    }

    fn commit(&self, id: &str, files: &[(&str, &str)]) {
        self.memory
            .repository
            .commit(REPO, id, files.iter().copied())
            .expect("commit");
    }

    fn commit_on(&self, parent: &str, id: &str, changes: &[(&str, Option<&str>)]) {
        let changes: Vec<(&str, Option<&[u8]>)> = changes
            .iter()
            .map(|(path, content)| (*path, content.map(str::as_bytes)))
            .collect();
        self.memory
            .repository
            .commit_on(REPO, parent, id, &changes)
            .expect("commit");
    }

    fn try_ingest(&self, commit: &str) -> Result<IngestOutcome, PublishError> {
        self.publisher
            .ingestor
            .ingest_commit(&CommitEvent::new(REPO, BRANCH, commit))
    }

    fn ingest(&self, commit: &str) -> IngestOutcome {
        self.try_ingest(commit).expect("ingest")
    }

    fn step(&self) -> DrainOutcome {
        self.publisher.worker.handle(DRAIN_TRIGGER).expect("drain step")
    }

    fn drain(&self) -> DrainReport {
        run_trampoline(&self.publisher.worker, &self.memory.notifier).expect("drain")
    }

    fn record(&self) -> PublishTarget {
        self.memory
            .status
            .get_consistent(&key())
            .expect("get")
            .unwrap_or_default()
    }

    /// Published objects, keyed by path below the destination prefix.
    fn target(&self) -> BTreeMap<String, Vec<u8>> {
        self.memory
            .blobs
            .keys(REPO)
            .into_iter()
            .filter_map(|key| {
                let body = self.memory.blobs.get(REPO, &key)?.body;
                Some((key.strip_prefix("main/")?.to_string(), body))
            })
            .collect()
    }

    /// Files of `commit` below `content/`, keyed by path relative to it.
    fn expected(&self, commit: &str) -> BTreeMap<String, Vec<u8>> {
        self.memory
            .repository
            .files(REPO, commit)
            .expect("files")
            .into_iter()
            .filter_map(|(path, body)| Some((path.strip_prefix("content/")?.to_string(), body)))
            .collect()
    }
}

fn key() -> StatusKey {
    StatusKey::new(REPO, BRANCH)
}

fn commit(id: &str) -> Option<CommitId> {
    Some(CommitId::from(id))
}

fn stale_config(policy: StalePolicy) -> PublisherConfig {
    PublisherConfig {
        stale_actions: policy,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// 1. Basic publish
// ---------------------------------------------------------------------------

#[test]
fn three_file_change_is_published() {
    let h = Harness::new();
    h.commit("A", &[("content/b.txt", "old b"), ("content/c.txt", "c")]);
    h.ingest("A");
    h.drain();
    assert_eq!(h.record().published_commit_id, commit("A"));

    h.commit_on(
        "A",
        "B",
        &[
            ("content/a.txt", Some("a")),
            ("content/b.txt", Some("new b")),
            ("content/c.txt", None),
        ],
    );
    let outcome = h.ingest("B");
    assert_eq!(outcome.action_count(), 3);

    let queued: Vec<(ActionKind, String)> = h
        .memory
        .queue
        .actions()
        .into_iter()
        .map(|a| (a.kind, a.path))
        .collect();
    assert_eq!(
        queued,
        vec![
            (ActionKind::Put, "content/a.txt".to_string()),
            (ActionKind::Put, "content/b.txt".to_string()),
            (ActionKind::Delete, "content/c.txt".to_string()),
        ]
    );
    let record = h.record();
    assert_eq!(record.remaining_actions, 3);
    assert_eq!(record.state(), PublishState::Publishing);

    let report = h.drain();
    assert_eq!(report.executed, 3);
    assert_eq!(report.finalized, vec![(key(), CommitId::from("B"))]);

    let record = h.record();
    assert_eq!(record.published_commit_id, commit("B"));
    assert_eq!(record.state(), PublishState::Idle);
    assert!(record.new_commit_id.is_none());

    let a = h.memory.blobs.get(REPO, "main/a.txt").expect("a.txt");
    assert_eq!(a.body, b"a");
    assert_eq!(a.content_type, "text/plain; charset=utf-8");
    assert_eq!(h.memory.blobs.get(REPO, "main/b.txt").expect("b.txt").body, b"new b");
    assert!(h.memory.blobs.get(REPO, "main/c.txt").is_none());
    assert!(h.memory.queue.is_empty());
}

#[test]
fn paths_outside_content_root_count_without_publishing() {
    let h = Harness::new();
    h.commit("A", &[("README.md", "readme"), ("content/a.txt", "a")]);
    let outcome = h.ingest("A");
    assert_eq!(outcome.action_count(), 2);

    let report = h.drain();
    assert_eq!((report.executed, report.skipped), (1, 1));
    assert_eq!(h.memory.blobs.keys(REPO), vec!["main/a.txt".to_string()]);
    assert_eq!(h.record().published_commit_id, commit("A"));
}

#[test]
fn site_config_moves_content_root() {
    let h = Harness::new();
    h.commit(
        "A",
        &[
            ("cody.yaml", "content_root: public\n"),
            ("public/index.html", "<h1>hi</h1>"),
            ("content/old.txt", "not published"),
        ],
    );
    h.ingest("A");
    assert_eq!(h.record().new_config["content_root"], "public");
    h.drain();

    assert_eq!(h.memory.blobs.keys(REPO), vec!["main/index.html".to_string()]);
    let index = h.memory.blobs.get(REPO, "main/index.html").expect("index");
    assert_eq!(index.content_type, "text/html; charset=utf-8");
    assert_eq!(h.record().published_config["content_root"], "public");
}

#[test]
fn non_trigger_payload_is_ignored() {
    let h = Harness::new();
    h.commit("A", &[("content/a.txt", "a")]);
    h.ingest("A");

    let outcome = h.publisher.worker.handle("  go  ").expect("handle");
    assert_eq!(outcome, DrainOutcome::Ignored);
    assert_eq!(h.memory.queue.len(), 1);
    assert_eq!(h.memory.queue.receive_count(&h.memory.queue.actions()[0]), 0);

    let outcome = h.publisher.worker.handle(" run\n").expect("handle");
    assert!(matches!(outcome, DrainOutcome::Completed { finalized: true, .. }));
}

#[test]
fn empty_queue_ends_the_trampoline() {
    let h = Harness::new();
    assert_eq!(h.step(), DrainOutcome::Idle);
    assert_eq!(h.memory.notifier.total(), 0, "idle drain must not re-trigger");
}

// ---------------------------------------------------------------------------
// 2. Empty diff fast path
// ---------------------------------------------------------------------------

#[test]
fn empty_diff_advances_published_commit_directly() {
    let h = Harness::new();
    h.commit("A", &[("content/a.txt", "a")]);
    h.ingest("A");
    h.drain();
    let triggers = h.memory.notifier.total();

    h.commit_on("A", "B", &[]);
    let outcome = h.ingest("B");
    assert_eq!(
        outcome,
        IngestOutcome::Published {
            commit_id: CommitId::from("B"),
            superseded: None
        }
    );
    assert_eq!(h.record().published_commit_id, commit("B"));
    assert_eq!(h.record().state(), PublishState::Idle);
    assert!(h.memory.queue.is_empty());
    assert_eq!(h.memory.notifier.total(), triggers, "no drain needed");
}

#[test]
fn empty_diff_while_publishing_clears_in_flight_target() {
    let h = Harness::new();
    h.commit("A", &[("content/a.txt", "a")]);
    h.ingest("A");
    h.drain();

    h.commit_on("A", "B", &[("content/draft.txt", Some("draft"))]);
    h.ingest("B");
    assert_eq!(h.record().state(), PublishState::Publishing);

    // C ignores everything B changed, including the ignore file itself.
    h.commit_on(
        "B",
        "C",
        &[(".codyignore", Some("content/draft.txt\n.codyignore\n"))],
    );
    let outcome = h.ingest("C");
    assert_eq!(
        outcome,
        IngestOutcome::Published {
            commit_id: CommitId::from("C"),
            superseded: commit("B")
        }
    );

    let record = h.record();
    assert_eq!(record.published_commit_id, commit("C"));
    assert_eq!(record.state(), PublishState::Idle);
    assert!(record.new_commit_id.is_none());

    let report = h.drain();
    assert_eq!(report.stale, 1);
    assert!(h.memory.queue.is_empty());
    assert_eq!(h.memory.blobs.keys(REPO), vec!["main/a.txt".to_string()]);
}

// ---------------------------------------------------------------------------
// 3. Control files
// ---------------------------------------------------------------------------

#[test]
fn ignore_file_edit_excludes_matching_paths_in_same_commit() {
    let h = Harness::new();
    h.commit("A", &[("content/a.txt", "a"), ("content/b.draft", "v1")]);
    h.ingest("A");
    h.drain();

    h.commit_on(
        "A",
        "B",
        &[
            (".codyignore", Some("# drafts stay private\n*.draft\n")),
            ("content/b.draft", Some("v2")),
            ("content/c.txt", Some("c")),
        ],
    );
    h.ingest("B");

    let paths: Vec<String> = h.memory.queue.actions().into_iter().map(|a| a.path).collect();
    assert_eq!(paths, vec![".codyignore".to_string(), "content/c.txt".to_string()]);
    assert_eq!(h.record().new_ignore_patterns, vec!["*.draft".to_string()]);

    h.drain();
    let record = h.record();
    assert_eq!(record.published_ignore_patterns, vec!["*.draft".to_string()]);
    assert_eq!(h.memory.blobs.get(REPO, "main/b.draft").expect("b").body, b"v1");
}

#[test]
fn deleting_ignore_file_resets_patterns() {
    let h = Harness::new();
    h.commit("A", &[(".codyignore", "*.tmp\n"), ("content/x.tmp", "x")]);
    h.ingest("A");
    h.drain();
    assert!(h.memory.blobs.keys(REPO).is_empty());

    h.commit_on("A", "B", &[(".codyignore", None), ("content/y.tmp", Some("y"))]);
    h.ingest("B");
    assert!(h.record().new_ignore_patterns.is_empty());
    h.drain();
    assert_eq!(h.memory.blobs.keys(REPO), vec!["main/y.tmp".to_string()]);
}

#[rstest]
#[case::bad_glob(".codyignore", "content/[z-a].txt\n")]
#[case::nested_config("cody.yaml", "menu:\n  - home\n")]
#[case::broken_yaml("cody.yaml", "content_root: [unclosed\n")]
fn malformed_control_file_leaves_record_untouched(#[case] path: &str, #[case] content: &str) {
    let h = Harness::new();
    h.commit("A", &[("content/a.txt", "a")]);
    h.ingest("A");
    h.drain();
    let before = h.record();
    let triggers = h.memory.notifier.total();

    h.commit_on("A", "B", &[(path, Some(content)), ("content/b.txt", Some("b"))]);
    let err = h.try_ingest("B").unwrap_err();
    match &err {
        PublishError::ControlFile { path: failed, .. } => assert_eq!(failed, path),
        other => panic!("expected control file error, got {other:?}"),
    }
    assert!(!err.is_transient());
    assert_eq!(h.record(), before);
    assert!(h.memory.queue.is_empty());
    assert_eq!(h.memory.notifier.total(), triggers);
}

// ---------------------------------------------------------------------------
// 4. Retarget and convergence
// ---------------------------------------------------------------------------

#[rstest]
fn converges_to_latest_commit_under_interleavings(
    #[values(DequeueOrder::Fifo, DequeueOrder::Lifo, DequeueOrder::Alternate)] order: DequeueOrder,
    #[values(0, 1, 3, 5, 6)] steps_before_retarget: usize,
) {
    let h = Harness::with(
        PublisherConfig::default(),
        MemoryQueue::with_order(Duration::from_secs(300), order),
    );
    h.commit(
        "A",
        &[
            ("content/1.txt", "one"),
            ("content/2.txt", "two"),
            ("content/3.txt", "three"),
            ("content/4.txt", "four"),
            ("content/5.txt", "five"),
        ],
    );
    h.commit_on(
        "A",
        "B",
        &[
            ("content/1.txt", Some("one v2")),
            ("content/2.txt", None),
            ("content/6.txt", Some("six")),
        ],
    );

    h.ingest("A");
    for _ in 0..steps_before_retarget {
        h.step();
        assert_ne!(h.record().published_commit_id, commit("B"));
    }
    h.ingest("B");

    while h.memory.notifier.take_one() {
        h.step();
        assert_ne!(
            h.record().published_commit_id,
            commit("A").filter(|_| steps_before_retarget < 5),
            "a superseded commit must never be marked published"
        );
    }

    let record = h.record();
    assert_eq!(record.published_commit_id, commit("B"));
    assert_eq!(record.state(), PublishState::Idle);
    assert!(h.memory.queue.is_empty());
    assert_eq!(h.target(), h.expected("B"));
}

#[test]
fn retarget_discards_stale_actions_without_counting_them() {
    let h = Harness::new();
    h.commit("A", &[("content/a.txt", "a"), ("content/b.txt", "b")]);
    h.commit_on("A", "B", &[("content/c.txt", Some("c"))]);

    h.ingest("A");
    let outcome = h.ingest("B");
    let IngestOutcome::Staged { batch, superseded, actions, .. } = outcome else {
        panic!("expected staged outcome");
    };
    assert_eq!(superseded, commit("A"));
    assert_eq!(batch, 2);
    // a.txt, b.txt (never published) and c.txt
    assert_eq!(actions, 3);

    let first = h.step();
    assert!(matches!(first, DrainOutcome::Stale { acked: true, .. }), "{first:?}");
    assert_eq!(h.record().remaining_actions, 3, "stale action must not decrement");

    let report = h.drain();
    assert_eq!(report.stale, 1);
    assert_eq!(report.finalized, vec![(key(), CommitId::from("B"))]);
    assert_eq!(h.target(), h.expected("B"));
}

#[test]
fn revert_while_draining_converges() {
    let h = Harness::new();
    h.commit("A", &[("content/x.txt", "1")]);
    h.ingest("A");
    h.drain();

    h.commit_on("A", "B", &[("content/x.txt", Some("2")), ("content/y.txt", Some("y"))]);
    h.ingest("B");
    assert!(matches!(h.step(), DrainOutcome::Completed { .. }));
    assert_eq!(h.memory.blobs.get(REPO, "main/x.txt").expect("x").body, b"2");

    // C restores A's tree while B is half done.
    h.commit_on("B", "C", &[("content/x.txt", Some("1")), ("content/y.txt", None)]);
    let outcome = h.ingest("C");
    assert!(matches!(outcome, IngestOutcome::Staged { actions: 2, .. }), "{outcome:?}");

    h.drain();
    assert_eq!(h.record().published_commit_id, commit("C"));
    assert_eq!(h.target(), h.expected("C"));
}

#[test]
fn commit_after_counted_but_unfinalized_batch_still_converges() {
    let h = Harness::new();
    h.commit("A", &[("content/a.txt", "a")]);
    h.ingest("A");
    h.drain();

    h.commit_on("A", "B", &[("content/b.txt", Some("b"))]);
    h.ingest("B");
    let batch = h.record().batch;
    // B's only action ran and was counted, then the worker died before
    // finalizing or acking.
    h.memory
        .blobs
        .put(
            &ObjectLocation {
                bucket: REPO.to_string(),
                key: "main/b.txt".to_string(),
            },
            b"b",
            "text/plain",
        )
        .expect("put");
    h.memory
        .status
        .conditional_update(
            &key(),
            &cody_core::StatusUpdate::CompleteAction { sequence: 0 },
            &cody_core::Condition::InFlight {
                commit_id: CommitId::from("B"),
                batch,
            },
        )
        .expect("complete");
    assert_eq!(h.record().state(), PublishState::Idle);

    h.commit_on("B", "C", &[("content/b.txt", None)]);
    h.ingest("C");
    h.memory.queue.expire_leases().expect("expire");
    h.drain();

    assert_eq!(h.record().published_commit_id, commit("C"));
    assert_eq!(h.target(), h.expected("C"));
}

#[test]
fn second_retarget_still_removes_paths_of_first_batch() {
    let h = Harness::new();
    h.commit("A", &[("content/keep.txt", "keep")]);
    h.ingest("A");
    h.drain();

    h.commit_on("A", "C1", &[("content/x.txt", Some("x")), ("content/y.txt", Some("y"))]);
    h.ingest("C1");
    assert!(matches!(h.step(), DrainOutcome::Completed { executed: true, .. }));
    assert!(h.memory.blobs.get(REPO, "main/x.txt").is_some());

    // C2 reverts to A's tree; C3 lands before C2's deletes ran.
    h.commit_on("C1", "C2", &[("content/x.txt", None), ("content/y.txt", None)]);
    let outcome = h.ingest("C2");
    assert!(matches!(outcome, IngestOutcome::Staged { actions: 2, .. }), "{outcome:?}");
    h.commit_on("C2", "C3", &[("content/z.txt", Some("z"))]);
    let outcome = h.ingest("C3");
    assert!(
        matches!(outcome, IngestOutcome::Staged { actions: 3, ref superseded, .. } if *superseded == commit("C2")),
        "{outcome:?}"
    );
    assert_eq!(
        h.record().superseded_commit_ids,
        vec![CommitId::from("C1"), CommitId::from("C2")]
    );

    h.drain();
    let record = h.record();
    assert_eq!(record.published_commit_id, commit("C3"));
    assert!(record.superseded_commit_ids.is_empty());
    assert_eq!(h.target(), h.expected("C3"));
}

#[rstest]
fn converges_after_a_chain_of_retargets(
    #[values(DequeueOrder::Fifo, DequeueOrder::Lifo, DequeueOrder::Alternate)] order: DequeueOrder,
    #[values(0, 1, 2)] steps_between_commits: usize,
) {
    let h = Harness::with(
        PublisherConfig::default(),
        MemoryQueue::with_order(Duration::from_secs(300), order),
    );
    h.commit(
        "A",
        &[
            ("content/1.txt", "one"),
            ("content/2.txt", "two"),
            ("content/3.txt", "three"),
        ],
    );
    h.commit_on("A", "B", &[("content/1.txt", Some("one v2")), ("content/4.txt", Some("four"))]);
    h.commit_on(
        "B",
        "C",
        &[
            ("content/1.txt", None),
            ("content/2.txt", Some("two v2")),
            ("content/5.txt", Some("five")),
        ],
    );
    h.commit_on("C", "D", &[("content/4.txt", None), ("content/1.txt", Some("one v3"))]);
    h.commit_on(
        "D",
        "E",
        &[
            ("content/5.txt", None),
            ("content/3.txt", None),
            ("content/6.txt", Some("six")),
        ],
    );

    for id in ["A", "B", "C", "D", "E"] {
        h.ingest(id);
        for _ in 0..steps_between_commits {
            h.step();
        }
    }
    h.drain();

    let record = h.record();
    assert_eq!(record.published_commit_id, commit("E"));
    assert_eq!(record.state(), PublishState::Idle);
    assert!(record.superseded_commit_ids.is_empty());
    assert_eq!(h.target(), h.expected("E"));
    assert!(h.memory.queue.is_empty());
}

// ---------------------------------------------------------------------------
// 5. Duplicate delivery and crash recovery
// ---------------------------------------------------------------------------

#[test]
fn duplicate_delivery_does_not_double_decrement() {
    let h = Harness::with(
        PublisherConfig::default(),
        MemoryQueue::with_order(Duration::from_secs(300), DequeueOrder::Lifo),
    );
    h.commit(
        "A",
        &[("content/a.txt", "a"), ("content/b.txt", "b"), ("content/c.txt", "c")],
    );
    h.ingest("A");
    let first = h.memory.queue.actions()[0].clone();
    h.memory.queue.enqueue(&first).expect("duplicate");
    h.memory.queue.enqueue(&first).expect("duplicate");

    h.step();
    h.step();
    assert_eq!(h.record().remaining_actions, 2, "duplicate counted once");
    h.step();
    assert_eq!(h.record().remaining_actions, 1);
    assert_eq!(h.record().state(), PublishState::Publishing);

    h.drain();
    assert_eq!(h.record().published_commit_id, commit("A"));
    assert_eq!(h.target(), h.expected("A"));
    assert!(h.memory.queue.is_empty());
}

#[test]
fn redelivery_after_crash_before_finalize_completes_the_batch() {
    let h = Harness::new();
    h.commit("A", &[("content/a.txt", "a"), ("content/b.txt", "b")]);
    h.ingest("A");
    let batch = h.record().batch;

    // Both actions were counted but the worker crashed before finalizing
    // and acking.
    for sequence in 0..2 {
        h.memory
            .status
            .conditional_update(
                &key(),
                &cody_core::StatusUpdate::CompleteAction { sequence },
                &cody_core::Condition::InFlight {
                    commit_id: CommitId::from("A"),
                    batch,
                },
            )
            .expect("complete");
    }
    assert_eq!(h.record().published_commit_id, None);

    let outcome = h.step();
    assert!(
        matches!(outcome, DrainOutcome::Completed { finalized: true, .. }),
        "{outcome:?}"
    );
    assert_eq!(h.record().published_commit_id, commit("A"));

    h.drain();
    assert!(h.memory.queue.is_empty());
}

#[test]
fn restaged_commit_rejects_messages_of_earlier_batch() {
    let h = Harness::new();
    h.commit("A", &[("content/a.txt", "a"), ("content/b.txt", "b")]);
    h.ingest("A");
    let outcome = h.ingest("A");
    assert!(matches!(outcome, IngestOutcome::Staged { batch: 2, actions: 2, .. }));
    assert_eq!(h.memory.queue.len(), 4);

    let report = h.drain();
    assert_eq!(report.stale, 2);
    assert_eq!(report.executed, 2);
    assert_eq!(report.finalized.len(), 1);
    assert_eq!(h.record().published_commit_id, commit("A"));
}

#[test]
fn transient_failure_surfaces_and_redelivery_recovers() {
    let h = Harness::new();
    h.commit("A", &[("content/a.txt", "a")]);
    h.ingest("A");
    h.memory.blobs.fail_next_puts(1);

    let err = run_trampoline(&h.publisher.worker, &h.memory.notifier).unwrap_err();
    assert!(err.is_transient());
    assert_eq!(h.record().remaining_actions, 1);
    assert_eq!(h.memory.queue.len(), 1, "failed message stays queued");

    h.memory.queue.expire_leases().expect("expire");
    h.memory.notifier.trigger().expect("tick");
    h.drain();
    assert_eq!(h.record().published_commit_id, commit("A"));
}

#[test]
fn delete_of_absent_object_succeeds() {
    let h = Harness::new();
    h.commit("A", &[("content/a.txt", "a"), ("content/c.txt", "c")]);
    h.ingest("A");
    h.drain();

    h.commit_on("A", "B", &[("content/c.txt", None)]);
    h.ingest("B");
    h.memory
        .blobs
        .delete(&ObjectLocation {
            bucket: REPO.to_string(),
            key: "main/c.txt".to_string(),
        })
        .expect("external delete");

    let report = h.drain();
    assert_eq!(report.executed, 1);
    assert_eq!(h.record().published_commit_id, commit("B"));
    assert_eq!(h.target(), h.expected("B"));
}

// ---------------------------------------------------------------------------
// 6. Stale message policies
// ---------------------------------------------------------------------------

#[test]
fn ack_and_retrigger_keeps_draining_past_stale_messages() {
    let h = Harness::with(stale_config(StalePolicy::AckAndRetrigger), MemoryQueue::default());
    h.commit("A", &[("content/a.txt", "a"), ("content/b.txt", "b")]);
    h.commit_on("A", "B", &[("content/a.txt", Some("a2"))]);
    h.ingest("A");
    h.ingest("B");
    // Only the trigger of the second ingest is available.
    h.memory.notifier.clear();
    h.memory.notifier.trigger().expect("trigger");

    let report = h.drain();
    assert_eq!(report.stale, 2);
    assert_eq!(report.left_for_redelivery, 0);
    assert_eq!(h.record().published_commit_id, commit("B"));
    assert!(h.memory.queue.is_empty());
}

#[test]
fn leave_for_redelivery_stops_and_relies_on_timeout() {
    let h = Harness::with(
        stale_config(StalePolicy::LeaveForRedelivery),
        MemoryQueue::default(),
    );
    h.commit("A", &[("content/a.txt", "a"), ("content/b.txt", "b")]);
    h.commit_on("A", "B", &[("content/a.txt", Some("a2"))]);
    h.ingest("A");
    h.ingest("B");
    h.memory.notifier.clear();
    h.memory.notifier.trigger().expect("trigger");

    let report = h.drain();
    assert_eq!(report.invocations, 1, "stale message stops the trampoline");
    assert_eq!(report.left_for_redelivery, 1);
    assert_eq!(h.memory.notifier.pending(), 0);
    assert_eq!(h.record().state(), PublishState::Publishing);

    // Each redelivery tick picks up the next visible message; leased stale
    // messages stay invisible meanwhile.
    h.memory.notifier.trigger().expect("tick");
    let report = h.drain();
    assert_eq!(report.left_for_redelivery, 1);
    h.memory.notifier.trigger().expect("tick");
    h.drain();
    assert_eq!(h.record().published_commit_id, commit("B"));
    assert_eq!(h.target(), h.expected("B"));

    // Stale messages come back after their visibility timeout.
    assert_eq!(h.memory.queue.len(), 2);
    h.memory.queue.expire_leases().expect("expire");
    h.memory.notifier.trigger().expect("tick");
    let report = h.drain();
    assert_eq!(report.stale, 1);
    assert_eq!(h.record().published_commit_id, commit("B"));
}

// ---------------------------------------------------------------------------
// 7. Batches of commit events
// ---------------------------------------------------------------------------

#[test]
fn batch_ingest_stops_at_first_failure() {
    let h = Harness::new();
    h.commit("A", &[("content/a.txt", "a")]);
    h.commit_on("A", "C", &[("content/c.txt", Some("c"))]);

    let events = [
        CommitEvent::new(REPO, BRANCH, "A"),
        CommitEvent::new(REPO, BRANCH, "missing"),
        CommitEvent::new(REPO, BRANCH, "C"),
    ];
    let err = h.publisher.ingestor.ingest_batch(&events).unwrap_err();
    assert!(err.is_transient());
    assert_eq!(h.record().new_commit_id, commit("A"), "C must not be attempted");

    let outcomes = h.publisher.ingestor.ingest_batch(&events[2..]).expect("retry");
    assert_eq!(outcomes.len(), 1);
    h.drain();
    assert_eq!(h.record().published_commit_id, commit("C"));
    assert_eq!(h.target(), h.expected("C"));
}

#[test]
fn branches_publish_independently() {
    let h = Harness::new();
    h.commit("A", &[("content/a.txt", "a")]);
    h.commit_on("A", "F", &[("content/f.txt", Some("f"))]);
    h.publisher
        .ingestor
        .ingest_batch(&[
            CommitEvent::new(REPO, BRANCH, "A"),
            CommitEvent::new(REPO, "feature", "F"),
        ])
        .expect("ingest");
    h.drain();

    assert_eq!(
        h.memory.blobs.keys(REPO),
        vec![
            "feature/a.txt".to_string(),
            "feature/f.txt".to_string(),
            "main/a.txt".to_string(),
        ]
    );
    let feature = h
        .memory
        .status
        .get_consistent(&StatusKey::new(REPO, "feature"))
        .expect("get")
        .expect("record");
    assert_eq!(feature.published_commit_id, commit("F"));
}
