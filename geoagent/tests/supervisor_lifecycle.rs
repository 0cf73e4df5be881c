//! End-to-end supervisor runs against scripted model replies and subprocess outcomes.
//!
//! Every adapter shares one `ScriptedLlm`, so each test lists the replies in
//! the order the stages consume them.

use std::fs;
use std::path::Path;

use geoagent::agents::coder::{CodeLoop, CodeLoopConfig};
use geoagent::agents::debugger::Debugger;
use geoagent::agents::evaluator::LlmEvaluator;
use geoagent::agents::file_search::LlmFileLookup;
use geoagent::agents::retrieval::CorpusRetriever;
use geoagent::core::run::RunResult;
use geoagent::core::transcript::Role;
use geoagent::core::transitions::Stage;
use geoagent::core::types::{AttemptClass, NextAgent, Task};
use geoagent::io::artifacts::read_transcript;
use geoagent::io::config::GeoagentConfig;
use geoagent::session::Harness;
use geoagent::supervisor::{
    Adapters, CancelToken, REASON_CANCELLED, REASON_DEBUG_BUDGET, REASON_MALFORMED_ADVICE,
    RunLimits, RunRequest, Supervisor, SupervisorEvent,
};
use geoagent::test_support::{
    ScriptStep, ScriptedLlm, ScriptedRunner, advice_reply, code_reply, evaluation_reply,
    filepaths_reply, sample_catalog, sample_corpus,
};

const QUERY: &str = "buffer the roads by 10 m and save the vector layer";

fn drive(
    llm: &ScriptedLlm,
    runner: &ScriptedRunner,
    limits: RunLimits,
    cancel: CancelToken,
    out: &Path,
    mut hook: impl FnMut(&SupervisorEvent),
) -> (RunResult, Vec<SupervisorEvent>) {
    let file_lookup = LlmFileLookup::new(llm, sample_catalog());
    let retriever = CorpusRetriever::new(sample_corpus());
    let code_loop = CodeLoop::new(llm, runner, CodeLoopConfig::default());
    let debugger = Debugger::new(llm);
    let evaluator = LlmEvaluator::new(llm).expect("evaluator");
    let supervisor = Supervisor::new(
        Adapters {
            file_lookup: &file_lookup,
            retriever: &retriever,
            code_loop: &code_loop,
            debugger: &debugger,
            evaluator: &evaluator,
        },
        limits,
    )
    .with_cancel(cancel);

    let mut events = Vec::new();
    let result = supervisor
        .run(
            RunRequest {
                session_id: "session-test".to_string(),
                run_id: "run-0001".to_string(),
                task: Task::new("run-0001", QUERY, out),
            },
            |event| {
                hook(event);
                events.push(event.clone());
            },
        )
        .expect("run");
    (result, events)
}

fn drive_default(llm: &ScriptedLlm, runner: &ScriptedRunner, out: &Path) -> RunResult {
    drive(llm, runner, RunLimits::default(), CancelToken::new(), out, |_| {}).0
}

fn failing_round() -> Vec<ScriptStep> {
    (0..5).map(|_| ScriptStep::traceback("NameError: boom")).collect()
}

fn code_replies(n: usize) -> Vec<String> {
    (0..n).map(|i| code_reply(&format!("print({i})"))).collect()
}

/// Happy path: one round succeeds, evaluation scores it, run ends in DONE.
#[test]
fn successful_run_reaches_done_with_evaluation() {
    let temp = tempfile::tempdir().expect("tempdir");
    let llm = ScriptedLlm::new([
        filepaths_reply(&["/data/roads.shp"]),
        code_reply("print('buffer')"),
        evaluation_reply(0.9),
    ]);
    let runner = ScriptedRunner::new([ScriptStep::success("roads_buffer.shp", "shape")]);

    let (result, events) = drive(
        &llm,
        &runner,
        RunLimits::default(),
        CancelToken::new(),
        temp.path(),
        |_| {},
    );

    assert!(result.is_done());
    assert_eq!(
        result.path,
        vec![
            Stage::Start,
            Stage::SelectFiles,
            Stage::RetrieveContext,
            Stage::GenerateCode,
            Stage::Evaluate,
            Stage::Done,
        ]
    );
    assert_eq!(result.files.len(), 1);
    assert_eq!(result.files[0].path, "/data/roads.shp");
    assert!(!result.context.is_empty());
    assert_eq!(result.final_code, "print('buffer')");
    assert_eq!(
        result.output_file.as_deref(),
        Some(temp.path().join("roads_buffer.shp").as_path())
    );
    let evaluation = result.evaluation.as_ref().expect("evaluation");
    assert_eq!(evaluation.code_accuracy.score, 0.9);
    assert!(result.failure.is_none());
    assert!(result.abort_reason.is_none());
    assert_eq!(llm.remaining(), 0);

    assert_eq!(
        events.first(),
        Some(&SupervisorEvent::Transition {
            from: Stage::Start,
            to: Stage::SelectFiles,
        })
    );
    assert!(events.contains(&SupervisorEvent::LoopFinished {
        round: 1,
        success: true,
        attempts: 1,
    }));
}

/// A failed round routed to the file agent re-runs file lookup and retrieval.
#[test]
fn debug_routing_to_file_agent_reruns_upstream_stages() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut replies = vec![filepaths_reply(&["/data/roads.shp"])];
    replies.extend(code_replies(5));
    replies.push(advice_reply("Open the layer by its full path.", "file_search_expert"));
    replies.push(filepaths_reply(&["/data/roads.shp", "/data/dem.tif"]));
    replies.push(code_reply("print('fixed')"));
    replies.push(evaluation_reply(0.7));
    let llm = ScriptedLlm::new(replies);

    let mut steps = failing_round();
    steps.push(ScriptStep::success("out.gpkg", "gpkg"));
    let runner = ScriptedRunner::new(steps);

    let result = drive_default(&llm, &runner, temp.path());

    assert!(result.is_done());
    assert_eq!(
        result.path,
        vec![
            Stage::Start,
            Stage::SelectFiles,
            Stage::RetrieveContext,
            Stage::GenerateCode,
            Stage::Debug,
            Stage::SelectFiles,
            Stage::RetrieveContext,
            Stage::GenerateCode,
            Stage::Evaluate,
            Stage::Done,
        ]
    );
    assert_eq!(result.rounds.len(), 2);
    assert_eq!(result.attempt_count(), 6);
    assert_eq!(result.files.len(), 2);
    assert_eq!(result.advices.len(), 1);
    assert_eq!(result.advices[0].next_agent, NextAgent::File);

    // The second round's first prompt carries the advice and the failures before it.
    let prompts = llm.prompts();
    let second_round = &prompts[8];
    assert!(second_round.contains("Open the layer by its full path."));
    assert!(second_round.contains("NameError: boom"));
}

#[test]
fn debug_routing_to_retrieval_skips_file_lookup() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut replies = vec![filepaths_reply(&["/data/roads.shp"])];
    replies.extend(code_replies(5));
    replies.push(advice_reply("Look up the writer API.", "rag_expert"));
    replies.push(code_reply("print('fixed')"));
    replies.push(evaluation_reply(0.6));
    let llm = ScriptedLlm::new(replies);

    let mut steps = failing_round();
    steps.push(ScriptStep::success("out.gpkg", "gpkg"));
    let runner = ScriptedRunner::new(steps);

    let result = drive_default(&llm, &runner, temp.path());

    assert!(result.is_done());
    assert_eq!(
        &result.path[4..7],
        &[Stage::Debug, Stage::RetrieveContext, Stage::GenerateCode]
    );
    assert_eq!(llm.remaining(), 0);
}

/// Advice without either block is re-queried once; a second miss aborts.
#[test]
fn malformed_advice_twice_aborts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut replies = vec![filepaths_reply(&["/data/roads.shp"])];
    replies.extend(code_replies(5));
    replies.push("I am not sure.".to_string());
    replies.push("Still not sure.".to_string());
    let llm = ScriptedLlm::new(replies);
    let runner = ScriptedRunner::new(failing_round());

    let result = drive_default(&llm, &runner, temp.path());

    assert!(!result.is_done());
    assert_eq!(result.abort_reason.as_deref(), Some(REASON_MALFORMED_ADVICE));
    assert_eq!(result.advices.len(), 2);
    assert!(result.advices.iter().all(|a| a.is_malformed()));
    assert_eq!(result.path.last(), Some(&Stage::Aborted));

    let failure = result.failure.as_ref().expect("failure summary");
    assert_eq!(failure.attempts.len(), 5);
    assert!(failure.last_error.contains("NameError: boom"));
    assert!(
        failure
            .attempts
            .iter()
            .all(|a| a.class == AttemptClass::Traceback)
    );
}

#[test]
fn malformed_advice_recovers_on_requery() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut replies = vec![filepaths_reply(&["/data/roads.shp"])];
    replies.extend(code_replies(5));
    replies.push("hmm".to_string());
    replies.push(advice_reply("Close the writer.", "code_generation_expert"));
    replies.push(code_reply("print('fixed')"));
    replies.push(evaluation_reply(0.8));
    let llm = ScriptedLlm::new(replies);

    let mut steps = failing_round();
    steps.push(ScriptStep::success("out.shp", "shp"));
    let runner = ScriptedRunner::new(steps);

    let result = drive_default(&llm, &runner, temp.path());

    assert!(result.is_done());
    assert_eq!(result.advices.len(), 2);
    assert!(result.advices[0].is_malformed());
    assert_eq!(result.advices[1].next_agent, NextAgent::Code);
    assert_eq!(
        &result.path[4..6],
        &[Stage::Debug, Stage::GenerateCode]
    );
}

/// An unparseable evaluation aborts but keeps the code and output produced.
#[test]
fn malformed_evaluation_aborts_with_partial_result() {
    let temp = tempfile::tempdir().expect("tempdir");
    let llm = ScriptedLlm::new([
        filepaths_reply(&["/data/roads.shp"]),
        code_reply("print('buffer')"),
        "Looks great to me.".to_string(),
    ]);
    let runner = ScriptedRunner::new([ScriptStep::success("roads.shp", "shape")]);

    let result = drive_default(&llm, &runner, temp.path());

    assert!(!result.is_done());
    let reason = result.abort_reason.as_deref().expect("abort reason");
    assert!(reason.starts_with("adapter contract violation"), "{reason}");
    assert_eq!(result.final_code, "print('buffer')");
    assert!(result.output_file.is_some());
    assert!(result.evaluation.is_none());
    assert_eq!(
        result.failure.as_ref().map(|f| f.last_error.as_str()),
        Some(reason)
    );
    assert_eq!(
        &result.path[3..],
        &[Stage::GenerateCode, Stage::Evaluate, Stage::Aborted]
    );
}

#[test]
fn unparseable_file_selection_aborts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let llm = ScriptedLlm::new(["the roads file, probably"]);
    let runner = ScriptedRunner::default();

    let result = drive_default(&llm, &runner, temp.path());

    assert!(!result.is_done());
    assert_eq!(
        result.path,
        vec![Stage::Start, Stage::SelectFiles, Stage::Aborted]
    );
    assert!(
        result
            .abort_reason
            .as_deref()
            .is_some_and(|r| r.starts_with("adapter contract violation"))
    );
    assert!(runner.seen().is_empty());
}

#[test]
fn debug_budget_exhaustion_aborts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut replies = vec![filepaths_reply(&["/data/roads.shp"])];
    replies.extend(code_replies(5));
    replies.push(advice_reply("Try again.", "code_generation_expert"));
    replies.extend(code_replies(5));
    let llm = ScriptedLlm::new(replies);

    let mut steps = failing_round();
    steps.extend(failing_round());
    let runner = ScriptedRunner::new(steps);

    let limits = RunLimits {
        max_debug_rounds: 1,
        ..RunLimits::default()
    };
    let (result, events) = drive(&llm, &runner, limits, CancelToken::new(), temp.path(), |_| {});

    assert_eq!(result.abort_reason.as_deref(), Some(REASON_DEBUG_BUDGET));
    assert_eq!(result.rounds.len(), 2);
    assert_eq!(result.advices.len(), 1);
    assert_eq!(
        &result.path[3..],
        &[
            Stage::GenerateCode,
            Stage::Debug,
            Stage::GenerateCode,
            Stage::Debug,
            Stage::Aborted,
        ]
    );
    assert_eq!(
        events.last(),
        Some(&SupervisorEvent::Aborted {
            reason: REASON_DEBUG_BUDGET.to_string(),
        })
    );
    assert_eq!(llm.remaining(), 0);
}

#[test]
fn cancelled_before_start_aborts_without_calls() {
    let temp = tempfile::tempdir().expect("tempdir");
    let llm = ScriptedLlm::default();
    let runner = ScriptedRunner::default();
    let cancel = CancelToken::new();
    cancel.cancel();

    let (result, _) = drive(&llm, &runner, RunLimits::default(), cancel, temp.path(), |_| {});

    assert_eq!(result.path, vec![Stage::Start, Stage::Aborted]);
    assert_eq!(result.abort_reason.as_deref(), Some(REASON_CANCELLED));
    assert!(llm.prompts().is_empty());
}

#[test]
fn cancellation_takes_effect_at_next_stage_boundary() {
    let temp = tempfile::tempdir().expect("tempdir");
    let llm = ScriptedLlm::new([filepaths_reply(&["/data/roads.shp"])]);
    let runner = ScriptedRunner::default();
    let cancel = CancelToken::new();
    let trigger = cancel.clone();

    let (result, _) = drive(
        &llm,
        &runner,
        RunLimits::default(),
        cancel,
        temp.path(),
        |event| {
            if matches!(event, SupervisorEvent::ContextRetrieved { .. }) {
                trigger.cancel();
            }
        },
    );

    assert_eq!(
        result.path,
        vec![
            Stage::Start,
            Stage::SelectFiles,
            Stage::RetrieveContext,
            Stage::Aborted,
        ]
    );
    assert_eq!(result.abort_reason.as_deref(), Some(REASON_CANCELLED));
    assert!(result.rounds.is_empty());
}

#[test]
fn cancel_after_evaluation_still_finishes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let llm = ScriptedLlm::new([
        filepaths_reply(&["/data/roads.shp"]),
        code_reply("print('buffer')"),
        evaluation_reply(0.8),
    ]);
    let runner = ScriptedRunner::new([ScriptStep::success("roads_buffer.shp", "shape")]);
    let cancel = CancelToken::new();
    let trigger = cancel.clone();

    let (result, _) = drive(
        &llm,
        &runner,
        RunLimits::default(),
        cancel,
        temp.path(),
        |event| {
            if matches!(event, SupervisorEvent::Evaluated { .. }) {
                trigger.cancel();
            }
        },
    );

    assert!(result.is_done());
    assert_eq!(result.path.last(), Some(&Stage::Done));
    assert!(result.abort_reason.is_none());
    assert!(result.evaluation.is_some());
}

#[test]
fn timed_out_round_is_debugged_and_regenerated() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut replies = vec![filepaths_reply(&["/data/roads.shp"])];
    replies.extend(code_replies(5));
    replies.push(advice_reply("Process the layer in chunks.", "code_generation_expert"));
    replies.push(code_reply("print('chunked')"));
    replies.push(evaluation_reply(0.5));
    let llm = ScriptedLlm::new(replies);

    let mut steps: Vec<ScriptStep> = (0..5).map(|_| ScriptStep::timeout()).collect();
    steps.push(ScriptStep::success("roads.gpkg", "gpkg"));
    let runner = ScriptedRunner::new(steps);

    let result = drive_default(&llm, &runner, temp.path());

    assert!(result.is_done());
    assert_eq!(
        &result.path[3..6],
        &[Stage::GenerateCode, Stage::Debug, Stage::GenerateCode]
    );
    assert!(
        result.rounds[0]
            .attempts
            .iter()
            .all(|a| a.class == AttemptClass::Timeout)
    );
    assert_eq!(result.advices[0].next_agent, NextAgent::Code);
    assert_eq!(result.final_code, "print('chunked')");
}

/// The session harness numbers runs and persists result, transcript and attempts.
#[test]
fn harness_persists_run_artifacts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = GeoagentConfig::default();
    config.output.root = temp.path().join("runs-root");

    let llm = ScriptedLlm::new([
        filepaths_reply(&["/data/roads.shp"]),
        code_reply("print('first')"),
        code_reply("print('second')"),
        evaluation_reply(0.9),
        filepaths_reply(&["/data/dem.tif"]),
        "not even close".to_string(),
    ]);
    let runner = ScriptedRunner::new([
        ScriptStep::no_sentinel("done\n"),
        ScriptStep::success("roads.shp", "shape"),
    ]);
    let mut harness = Harness::new(&config, &llm, &runner, sample_catalog(), sample_corpus())
        .expect("harness");

    let first = harness.run_query(QUERY, |_| {}).expect("first run");
    assert!(first.result.is_done());
    assert_eq!(first.result.run_id, "run-0001");
    assert!(first.paths.output_dir.join("roads.shp").is_file());

    let saved: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&first.paths.result_path).expect("read result"))
            .expect("parse result");
    assert_eq!(saved["status"], "done");
    assert_eq!(saved["run_id"], "run-0001");
    assert!(saved.get("transcript").is_none());

    let transcript = read_transcript(&first.paths.transcript_path).expect("transcript");
    assert_eq!(transcript.first().map(|m| m.role), Some(Role::User));
    assert!(transcript.iter().any(|m| m.role == Role::Tool));

    let attempt_one = first.paths.attempt_dir(1, 1);
    assert_eq!(
        fs::read_to_string(attempt_one.join("script.py")).expect("script copy"),
        "print('first')"
    );
    assert_eq!(
        fs::read_to_string(attempt_one.join("stdout.log")).expect("stdout copy"),
        "done\n"
    );
    let meta: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(attempt_one.join("meta.json")).expect("meta"))
            .expect("parse meta");
    assert_eq!(meta["class"], "missing_sentinel");
    assert!(first.paths.attempt_dir(1, 2).join("meta.json").is_file());

    let second = harness.run_query("clip the dem", |_| {}).expect("second run");
    assert!(!second.result.is_done());
    assert_eq!(second.result.run_id, "run-0002");
    assert!(second.paths.result_path.is_file());
    assert_eq!(harness.history(), ["run-0001", "run-0002"]);

    let before = harness.session_id().to_string();
    harness.reset();
    assert_ne!(harness.session_id(), before);
    assert!(harness.history().is_empty());
}
