//! Reviewer selection and review submission.

use anyhow::Result;

use crate::store::{Agent, ReviewOutcome, StageType, StoreHandle, Task, TaskStatus};

/// Stage whose entry triggers reviewer assignment.
pub const IN_REVIEW_STAGE: &str = "InReview";

/// Pick an agent to review the task, preferring anyone other than the DRI
/// (the author). When the InReview stage defines a candidate pool, the pool
/// restricts the choice; within the eligible set the first agent in
/// insertion order wins. Returns None when no non-DRI agent exists, leaving
/// the assignee unchanged.
pub async fn pick_reviewer(
    store: &StoreHandle,
    task: &Task,
    agents: &[Agent],
) -> Option<String> {
    let dri = task.dri.clone().unwrap_or_default();

    if let Some(wf_id) = task.workflow_id.clone().filter(|w| !w.is_empty()) {
        let stages = store
            .call(move |s| s.get_workflow_stages(&wf_id))
            .await
            .unwrap_or_default();
        if let Some(stage) = stages.iter().find(|s| s.stage_name == IN_REVIEW_STAGE) {
            let pool = stage.candidate_pool();
            if !pool.is_empty() {
                if let Some(candidate) = agents
                    .iter()
                    .find(|a| pool.contains(&a.name) && a.name != dri)
                {
                    return Some(candidate.name.clone());
                }
            }
        }
    }

    agents
        .iter()
        .find(|a| a.name != dri)
        .map(|a| a.name.clone())
}

/// Record a review and apply its workflow transition. `changes_requested`
/// additionally reassigns the task to the DRI so rework returns to the
/// author. Reaching a terminal stage flips status to done.
pub async fn submit_review(
    store: &StoreHandle,
    team_name: &str,
    task_id: i64,
    reviewer_agent: &str,
    outcome: ReviewOutcome,
    comments: &str,
) -> Result<()> {
    {
        let (team, reviewer, comments) = (
            team_name.to_string(),
            reviewer_agent.to_string(),
            comments.to_string(),
        );
        store
            .call(move |s| s.create_task_review(&team, task_id, &reviewer, outcome, &comments))
            .await?;
    }

    let task = {
        let team = team_name.to_string();
        store.call(move |s| s.get_task(&team, task_id)).await?
    };
    let Some(task) = task else { return Ok(()) };
    let Some(wf_id) = task.workflow_id.clone().filter(|w| !w.is_empty()) else {
        return Ok(());
    };
    let stage_name = task.current_stage.clone().unwrap_or_default();

    let next = {
        let (wf, from) = (wf_id.clone(), stage_name.clone());
        let out = outcome.as_str().to_string();
        store
            .call(move |s| {
                Ok(s.get_workflow_transitions(&wf)?
                    .into_iter()
                    .find(|t| t.from_stage == from && t.outcome == out)
                    .map(|t| t.to_stage))
            })
            .await?
    };
    let Some(next) = next else { return Ok(()) };

    {
        let (wf, stage) = (wf_id.clone(), next.clone());
        store
            .call(move |s| s.set_task_workflow_and_stage(task_id, &wf, &stage))
            .await?;
    }

    if outcome == ReviewOutcome::ChangesRequested {
        if let Some(dri) = task.dri.clone().filter(|d| !d.is_empty()) {
            store
                .call(move |s| s.set_task_status(task_id, TaskStatus::InProgress, Some(&dri)))
                .await?;
        }
    }

    let terminal = {
        let (wf, stage) = (wf_id, next);
        store
            .call(move |s| {
                Ok(s.get_workflow_stages(&wf)?
                    .iter()
                    .any(|st| st.stage_name == stage && st.stage_type == StageType::Terminal))
            })
            .await?
    };
    if terminal {
        store
            .call(move |s| s.set_task_status(task_id, TaskStatus::Done, None))
            .await?;
    }
    Ok(())
}
