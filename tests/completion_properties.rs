//! Property tests for the completion barrier: whatever order outcomes arrive
//! in, and however often they are repeated, a release reaches done exactly
//! once and its count never moves backwards. The same holds when the
//! reports race each other on a multi-threaded runtime.

mod fixtures;
mod helpers;

use futures::future::join_all;
use proptest::prelude::*;
use std::collections::BTreeMap;
use uuid::Uuid;

use fixtures::*;
use helpers::*;
use shotdiff::models::build::NotifyPolicy;
use shotdiff::models::release::ReleaseStatus;
use shotdiff::models::task::{CaptureError, ImageRef, TaskId, TaskOutcome};
use shotdiff::services::tracker::ReportOutcome;
use shotdiff::store::ReleaseStore;

/// Two pages, two sizes each: eight tasks.
const TASKS: usize = 8;

fn outcome_for(task: &TaskId, captured: bool, round: u32) -> TaskOutcome {
    if captured {
        ImageRef {
            key: format!("missing/{}/{}.png", task, round),
            sha256: format!("{:064x}", round),
            width: 8,
            height: 8,
            regions: BTreeMap::new(),
        }
        .into()
    } else {
        CaptureError::NonRetriable {
            detail: format!("round {}", round),
        }
        .into()
    }
}

/// Every task once in a shuffled order, with repeats spliced in anywhere.
fn arb_schedule() -> impl Strategy<Value = Vec<(usize, bool)>> {
    let order = Just((0..TASKS).collect::<Vec<_>>()).prop_shuffle();
    let repeats = prop::collection::vec((0..TASKS, any::<prop::sample::Index>()), 0..12);
    let captured = prop::collection::vec(any::<bool>(), TASKS * 3);
    (order, repeats, captured).prop_map(|(order, repeats, captured)| {
        let mut schedule: Vec<usize> = order;
        for (task, at) in repeats {
            let pos = at.index(schedule.len() + 1);
            schedule.insert(pos, task);
        }
        schedule
            .into_iter()
            .enumerate()
            .map(|(i, task)| (task, captured[i % captured.len()]))
            .collect()
    })
}

async fn submitted() -> (TestPipeline, Uuid, Vec<TaskId>) {
    let t = TestPipeline::strict(PageCapture::new());
    t.store
        .put_build(&build("site", false, NotifyPolicy::Both))
        .await
        .expect("build");
    let mut home = page("home", "/");
    let mut pricing = page("pricing", "/pricing");
    for spec in [&mut home, &mut pricing] {
        spec.sizes.push(shotdiff::models::task::ScreenSize::new(375, 812));
    }
    let response = t
        .pipeline
        .releases
        .submit(submission("site", "v1", vec![home, pricing]))
        .await
        .expect("submit");
    let ids = t
        .store
        .list_tasks(response.candidate_id)
        .await
        .expect("tasks")
        .into_iter()
        .map(|task| task.id)
        .collect();
    (t, response.candidate_id, ids)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn release_completes_exactly_once(schedule in arb_schedule()) {
        tokio_test::block_on(async {
            let (t, id, tasks) = submitted().await;
            prop_assert_eq!(tasks.len(), TASKS);

            let mut completions = 0;
            let mut last_reported = 0;
            let mut first_outcome: BTreeMap<TaskId, TaskOutcome> = BTreeMap::new();

            for (round, (index, captured)) in schedule.iter().enumerate() {
                let task = &tasks[*index];
                let outcome = outcome_for(task, *captured, round as u32);
                first_outcome.entry(task.clone()).or_insert_with(|| outcome.clone());

                let reported = match t.pipeline.tracker.report(id, task, outcome).await {
                    Ok(ReportOutcome::Completed { expected }) => {
                        completions += 1;
                        expected
                    }
                    Ok(ReportOutcome::Recorded { reported, .. }) => reported,
                    Ok(ReportOutcome::Duplicate { reported, .. }) => reported,
                    Err(e) => return Err(TestCaseError::fail(e.to_string())),
                };
                prop_assert!(reported >= last_reported);
                last_reported = reported;

                let release = t.store.get_release(id).await.unwrap().unwrap();
                prop_assert_eq!(release.status == ReleaseStatus::Done, completions == 1);
            }

            prop_assert_eq!(completions, 1);

            let ledger = t.store.ledger(id).await.unwrap().unwrap();
            prop_assert_eq!(ledger.reported() as usize, TASKS);
            // The first report for a task wins; repeats never overwrite it.
            prop_assert_eq!(&ledger.outcomes, &first_outcome);

            let results = t.store.list_comparisons(id).await.unwrap();
            prop_assert_eq!(results.len(), TASKS / 2);
            prop_assert_eq!(t.callbacks_posted().len(), 1);
            Ok(())
        })?;
    }

    #[test]
    fn cancel_after_partial_progress_still_completes_once(
        schedule in arb_schedule(),
        cut in 0..TASKS,
    ) {
        tokio_test::block_on(async {
            let (t, id, tasks) = submitted().await;

            for (round, (index, captured)) in schedule.iter().take(cut).enumerate() {
                let task = &tasks[*index];
                t.pipeline
                    .tracker
                    .report(id, task, outcome_for(task, *captured, round as u32))
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
            let before = t.store.ledger(id).await.unwrap().unwrap().reported();

            let cancelled = t
                .pipeline
                .tracker
                .cancel(id)
                .await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert!(cancelled.newly_cancelled);
            prop_assert_eq!(cancelled.forced + before, TASKS as u32);

            let release = t.store.get_release(id).await.unwrap().unwrap();
            prop_assert_eq!(release.status, ReleaseStatus::Done);
            prop_assert!(release.is_cancelled());

            // Late reports from workers that were mid-capture change nothing.
            for task in &tasks {
                let late = t
                    .pipeline
                    .tracker
                    .report(id, task, outcome_for(task, true, 99))
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                let is_duplicate = matches!(late, ReportOutcome::Duplicate { .. });
                prop_assert!(is_duplicate);
            }
            prop_assert_eq!(t.callbacks_posted().len(), 1);
            Ok(())
        })?;
    }
}

/// Copies of each task's report in flight at once.
const RACERS: usize = 3;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reports_complete_exactly_once() {
    for round in 0..16u32 {
        let (t, id, tasks) = submitted().await;

        let reports = tasks.iter().cycle().take(TASKS * RACERS).enumerate().map(|(i, task)| {
            let tracker = t.pipeline.tracker.clone();
            let task = task.clone();
            let outcome = outcome_for(&task, i % 2 == 0, round);
            tokio::spawn(async move { tracker.report(id, &task, outcome).await })
        });
        let outcomes: Vec<ReportOutcome> = join_all(reports)
            .await
            .into_iter()
            .map(|joined| joined.expect("report task panicked").expect("report failed"))
            .collect();

        let completed = outcomes
            .iter()
            .filter(|o| matches!(o, ReportOutcome::Completed { .. }))
            .count();
        assert_eq!(completed, 1, "round {}: {:?}", round, outcomes);
        let ledger = t.store.ledger(id).await.unwrap().unwrap();
        assert_eq!(ledger.reported() as usize, TASKS);

        let release = t.store.get_release(id).await.unwrap().unwrap();
        assert_eq!(release.status, ReleaseStatus::Done);
        assert_eq!(release.reported_count as usize, TASKS);
        assert_eq!(t.store.list_comparisons(id).await.unwrap().len(), TASKS / 2);
        assert_eq!(t.callbacks_posted().len(), 1);
    }
}
