//! Compiled-in prompt templates for every stage.
//!
//! Each template can be overridden by dropping a file with the same name
//! under `.maestro/prompts/` (see `template::load`). Placeholders are
//! `{{name}}` and are validated at render time.

/// Stage 0: turn the operator's request into a run specification, asking
/// clarification questions when the request is underspecified.
pub const BOOTSTRAP: &str = r#"You are preparing an autonomous engineering run.

## REQUEST
{{initial_prompt}}

## YOUR JOB
1. Study the codebase in the current directory.
2. Write a complete high-level specification of the requested change to
   {{coord_dir}}/AI_PROMPT.md: goals, constraints, affected areas, and
   acceptance criteria.
3. If the request is ambiguous in ways that would change the implementation,
   write {{coord_dir}}/CLARIFICATION_QUESTIONS.json as a JSON array of
   {"id", "question"} objects instead of guessing. Only ask questions whose
   answers materially change the work.

## CRITICAL RULES
1. Do not modify any file outside {{coord_dir}}.
2. AI_PROMPT.md must be self-contained; later stages see nothing else.
"#;

/// Stage 1: fold clarification answers into the final specification.
pub const CLARIFY: &str = r#"You are finalizing the specification for an autonomous engineering run.

## ORIGINAL REQUEST
{{initial_prompt}}

## QUESTIONS ASKED
{{questions}}

## OPERATOR ANSWERS
{{answers}}

## YOUR JOB
Rewrite {{coord_dir}}/AI_PROMPT.md as the authoritative specification,
incorporating every answer. Remove open questions; decide and document
anything still ambiguous.

## CRITICAL RULES
1. Do not modify any file outside {{coord_dir}}.
2. AI_PROMPT.md must be self-contained; later stages see nothing else.
"#;

/// Stage 2: decompose the specification into task folders.
pub const DECOMPOSE: &str = r#"You are decomposing a specification into executable tasks.

## SPECIFICATION
{{spec}}

## YOUR JOB
Create one folder per task under {{coord_dir}}, named TASK1, TASK2, ...
Each folder contains exactly one file, TASK.md, with this shape:

@dependencies [TASK1, TASK2]
@scope backend|frontend|integration   (only when the run spans repositories)

# <title>

<what this task delivers, concretely>

## Acceptance
<verifiable completion criteria>

## CRITICAL RULES
1. The @dependencies line is the FIRST line of TASK.md. Use
   "@dependencies none" for tasks with no prerequisites.
2. Tasks must be independently implementable once their dependencies land.
3. Prefer 3-10 focused tasks over one monolith or dozens of slivers.
4. Do not modify any file outside {{coord_dir}}.
"#;

/// Stage 3: fill in missing `@dependencies` lines across task files.
pub const ASSIGN_DEPS: &str = r#"You are assigning dependencies between tasks.

## TASKS
{{task_list}}

## YOUR JOB
For every task listed as missing dependencies, edit its
{{coord_dir}}/<id>/TASK.md so the FIRST line is a dependency declaration:

@dependencies [TASK1, TASK3]

or, for tasks with no prerequisites:

@dependencies none

## CRITICAL RULES
1. Only reference task ids that exist in the list above.
2. No cycles: a task may only depend on tasks it genuinely needs first.
3. Touch nothing but the TASK.md files named above.
"#;

/// Stage 4: write the blueprint and execution skeleton, deciding splits.
pub const PLAN: &str = r#"You are planning task {{task_id}}.

## TASK
{{task_file}}

## RUN SPECIFICATION
{{spec}}

## COMPLETED DEPENDENCIES
{{dependency_context}}

## YOUR JOB
1. Research the codebase enough to plan precisely; record notable findings
   in {{task_dir}}/RESEARCH.md.
2. Write {{task_dir}}/BLUEPRINT.md with these sections:
   ## 1. IDENTITY        - task id, title, @difficulty fast|medium|hard
   ## 2. CONTEXT CHAIN   - bullet list of files to read before implementing
   ## 3. EXECUTION CONTRACT - ordered phases of the implementation
   ## 4. ACCEPTANCE      - verifiable completion criteria
3. Initialize {{task_dir}}/execution.json: status "pending", attempts 0,
   one phases[] entry per contract phase (status "pending"), empty
   artifacts/errorHistory/uncertainties, completion.status
   "pending_validation", beyondTheBasics.cleanup flags false.
4. If the task is too large to land as one unit, SPLIT it instead: create
   sibling folders {{task_id}}.1, {{task_id}}.2, ... each with its own
   TASK.md (first line @dependencies) and BLUEPRINT.md, then delete this
   task's folder entirely. If you keep the task whole, record the decision
   in {{task_dir}}/split.txt ("kept").

## CRITICAL RULES
1. The context chain lists real, existing file paths, one per bullet.
2. Phases are small and independently checkable.
3. Do not implement anything yet.
"#;

/// Stage 5: implement the blueprint, keeping the execution record current.
pub const IMPLEMENT: &str = r#"You are implementing task {{task_id}}.

## BLUEPRINT
{{blueprint}}

## EXECUTION RECORD ({{task_dir}}/execution.json)
{{execution}}

## CONTEXT FROM COMPLETED TASKS
{{cross_context}}

## YOUR JOB
Work through the blueprint's execution contract phase by phase:
1. Set the phase's status to "in_progress", then "completed" when its
   acceptance holds; set status "failed" and append to errorHistory
   ({"timestamp", "phase", "message"}) when you cannot complete it.
2. Record every file you create or modify in artifacts as
   {"type": "file"|"test"|"doc", "path": "..."}.
3. Record assumptions in uncertainties ({"id", "topic", "assumption",
   "confidence"}); add a "resolution" once confirmed.
4. Keep {{task_dir}}/CONTEXT.md current: what changed, where, and why the
   next stages should care.
5. When every phase is completed: set status "completed", fill
   completion.summary and completion.forFutureTasks, and set all three
   beyondTheBasics.cleanup flags truthfully after actually cleaning up
   (no debug logging left, formatting consistent, no dead code).
6. If you are stuck, set status "blocked" and completion.blockedBy with the
   concrete blockers. Do not fake progress.

## CRITICAL RULES
1. execution.json is the source of truth; update it as you go, not at the end.
2. Run the project's tests/checks before marking a phase completed.
"#;

/// Review checklist completion (fast model; bounded structural work).
pub const CHECKLIST: &str = r#"You are verifying the review checklist for task {{task_id}}.

## CHECKLIST ({{checklist_path}})
{{items}}

## RAW JSON
{{raw_json}}

## YOUR JOB
For each item, open the file, verify the described change is present and
correct, and set the item's "reviewed" field to true in
{{checklist_path}}. Leave "reviewed" false for anything you cannot verify,
and append a short note to the item explaining why.

## CRITICAL RULES
1. Verify against the actual files, not the descriptions.
2. Modify only {{checklist_path}}.
"#;

/// Review pass: validate the implementation against the blueprint.
pub const REVIEW: &str = r###"You are reviewing task {{task_id}}.

## BLUEPRINT
{{blueprint}}

## READING LIST
{{reading_list}}

## YOUR JOB
1. Read the blueprint's acceptance criteria and the files above.
2. Verify the implementation satisfies every criterion; run the project's
   tests/checks where available.
3. Write your verdict to {{code_review_path}} with a "## Status" section
   whose first line is either "approved" or "rejected: <reason>", followed
   by findings.
4. Update {{execution_path}} to match reality:
   - approved: completion.status "completed", completion.codeReviewPassed
     true, completion.summary filled.
   - rejected: status "blocked", completion.codeReviewPassed false, append
     each finding to errorHistory, reset the offending phases to "pending".

## CRITICAL RULES
1. Approve only what you verified; a plausible-looking diff is not evidence.
2. Never create new source files during review.
"###;

/// Deep re-analysis after repeated blocks (hard model).
pub const REANALYZE: &str = r#"Task {{task_id}} has failed repeatedly and needs a fresh plan.

## BLUEPRINT
{{blueprint}}

## CURRENT PHASE
{{current_phase}}

## RECENT FAILURES
{{recent_errors}}

## OPEN UNCERTAINTIES
{{open_uncertainties}}

## SUPPLEMENTARY CONTEXT FILES
{{context_files}}

## YOUR JOB
1. Diagnose the root cause of the repeated failures; do not repeat the
   previous approach if it failed for structural reasons.
2. Rewrite the blueprint's execution contract to a plan that avoids the
   failure mode. Update {{task_id}}'s BLUEPRINT.md in place.
3. In {{execution_path}}: reset blocked/failed phases to "pending", set
   status "pending", increment attempts, resolve uncertainties you can now
   answer, and add guidance to completion.forFutureTasks.

## CRITICAL RULES
1. Never create new files; only BLUEPRINT.md and execution.json change.
2. The new plan must address each recent failure explicitly.
"#;

/// Finalizer: one hardening pass over the cumulative diff.
pub const CRITICAL_REVIEW: &str = r#"You are auditing the entire change set before release.

## CUMULATIVE DIFF
{{diff}}

## YOUR JOB
1. Hunt for critical bugs only: data loss, corruption, security holes,
   crashes on main paths, broken invariants between tasks' changes.
2. Write findings to {{bugs_path}} (append a dated section). Fix what you
   find, re-running tests to confirm.
3. When, and only when, no critical bugs remain, write {{marker_path}}
   containing a one-paragraph summary of what was audited.

## CRITICAL RULES
1. Style nits and refactors are out of scope; critical defects only.
2. Do not write {{marker_path}} while any known critical bug is unfixed.
"#;
