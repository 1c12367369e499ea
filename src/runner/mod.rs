mod shell;

use std::sync::Arc;

use actix::prelude::*;
use color_eyre::eyre;

pub use self::shell::Invocation;
use crate::{
    config::RestartTarget,
    github::PushEvent,
    lock_manager::{Coalesce, LockManager, Outcome},
};

/// Command line of the loop script that keeps a site running.
pub const RUN_SCRIPT: &str = "run.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Stop the run script so that its supervisor starts the new version.
    KillScript,
    /// Update the working copy; the run script restarts the site on changes.
    Pull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub step: Step,
    pub invocation: Invocation,
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "eyre::Result<()>")]
pub struct Task {
    pub target: RestartTarget,
    pub event: Arc<PushEvent>,
}

/// Decides what has to run on `target` for `event`, in order.
pub fn plan(target: &RestartTarget, event: &PushEvent, watched_branch: &str) -> Vec<PlannedStep> {
    if !event.is_on(watched_branch) {
        return Vec::new();
    }

    let mut steps = Vec::with_capacity(2);
    if event.script_updated() {
        steps.push(PlannedStep {
            step: Step::KillScript,
            invocation: Invocation::new(
                target,
                "pkill",
                &["-U", target.user.as_str(), "-f", RUN_SCRIPT],
            ),
        });
    }
    steps.push(PlannedStep {
        step: Step::Pull,
        invocation: Invocation::new(target, "git", &["pull"]),
    });
    steps
}

impl Coalesce for Vec<PlannedStep> {
    /// Keeps the later plan, but a kill requested by an earlier push still happens.
    fn coalesce(self, mut later: Self) -> Self {
        if later.iter().all(|planned| planned.step != Step::KillScript) {
            if let Some(kill) = self
                .into_iter()
                .find(|planned| planned.step == Step::KillScript)
            {
                later.insert(0, kill);
            }
        }
        later
    }
}

/// Runs the steps in order. A failed kill is only logged; a failed pull ends the run.
pub fn run_steps(target: &RestartTarget, steps: &[PlannedStep]) -> eyre::Result<()> {
    for PlannedStep { step, invocation } in steps {
        match invocation.run() {
            Ok(output) => {
                tracing::info!(output = output.as_str(), "Ran {}", invocation);
            }
            // `pkill` fails when nothing matched; the pull still has to happen.
            Err(err) if *step == Step::KillScript => {
                tracing::warn!("Failed killing run script: {}", err);
            }
            Err(err) => {
                return Err(
                    eyre::Report::new(err).wrap_err(format!("Failed to restart {}", target))
                );
            }
        }
    }

    tracing::info!("Successfully restarted {}", target);
    Ok(())
}

type Planner = fn(&RestartTarget, &PushEvent, &str) -> Vec<PlannedStep>;

#[derive(Clone)]
pub struct Restarter {
    watched_branch: String,
    lock_manager: Arc<LockManager<RestartTarget, Vec<PlannedStep>>>,
    planner: Planner,
}

impl Restarter {
    pub fn new(
        watched_branch: String,
        lock_manager: Arc<LockManager<RestartTarget, Vec<PlannedStep>>>,
    ) -> Self {
        Self {
            watched_branch,
            lock_manager,
            planner: plan,
        }
    }

    fn process_task(&self, task: Task) -> eyre::Result<()> {
        let Task { target, event } = task;

        let steps = (self.planner)(&target, &event, &self.watched_branch);
        if steps.is_empty() {
            tracing::info!(
                "Ignoring push to {}, only {} is deployed",
                event.reference,
                self.watched_branch,
            );
            return Ok(());
        }

        let outcome = self
            .lock_manager
            .run_coalesced(target.clone(), steps, |steps| {
                let res = run_steps(&target, &steps);
                if let Err(err) = &res {
                    tracing::error!("{:#}", err);
                }
                res
            });
        match outcome {
            Outcome::Ran(res) => res,
            Outcome::Deferred => {
                tracing::info!(
                    "Restart of {} already running, it will pick this push up",
                    target
                );
                Ok(())
            }
        }
    }
}

impl Actor for Restarter {
    type Context = SyncContext<Self>;
}

impl Handler<Task> for Restarter {
    type Result = <Task as Message>::Result;

    fn handle(&mut self, task: Task, _ctx: &mut Self::Context) -> Self::Result {
        let span = tracing::info_span!(
            "restart",
            user = task.target.user.as_str(),
            path = %task.target.path.display(),
            reference = task.event.reference.as_str(),
        );
        let _guard = span.enter();
        self.process_task(task)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::{Path, PathBuf},
        time::Duration,
    };

    use nix::unistd::{getuid, User};

    use super::{shell::ShellError, *};
    use crate::github::Commit;

    fn site() -> RestartTarget {
        "site:/home/site/ref_site".parse().unwrap()
    }

    fn parse_event(json: &str) -> PushEvent {
        serde_json::from_str(json).unwrap()
    }

    fn restarter() -> Restarter {
        Restarter::new("refs/heads/master".into(), Arc::new(LockManager::new()))
    }

    #[test]
    fn kills_then_pulls_when_script_changed() {
        let event =
            parse_event(r#"{"ref":"refs/heads/master","commits":[{"modified":["run.sh"]}]}"#);
        let steps = plan(&site(), &event, "refs/heads/master");

        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step, Step::KillScript);
        assert_eq!(steps[0].invocation.program, "pkill");
        assert_eq!(steps[0].invocation.args, ["-U", "site", "-f", "run.sh"]);
        assert_eq!(steps[1].step, Step::Pull);
        assert_eq!(steps[1].invocation.command_line(), "git pull");
        for step in &steps {
            assert_eq!(step.invocation.user, "site");
            assert_eq!(step.invocation.dir, PathBuf::from("/home/site/ref_site"));
        }
    }

    #[test]
    fn only_pulls_without_script_changes() {
        let event = PushEvent {
            reference: "refs/heads/master".into(),
            commits: vec![
                Commit {
                    modified: vec!["index.html".into()],
                },
                Commit {
                    modified: vec!["static/app.css".into()],
                },
            ],
        };
        let steps = plan(&site(), &event, "refs/heads/master");

        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step, Step::Pull);
    }

    #[test]
    fn skips_other_branches() {
        let event = parse_event(r#"{"ref":"refs/heads/develop","commits":[]}"#);
        assert!(plan(&site(), &event, "refs/heads/master").is_empty());

        let event =
            parse_event(r#"{"ref":"refs/heads/develop","commits":[{"modified":["run.sh"]}]}"#);
        assert!(plan(&site(), &event, "refs/heads/master").is_empty());
    }

    #[test]
    fn follows_configured_branch() {
        let event = parse_event(r#"{"ref":"refs/heads/main","commits":[]}"#);
        assert!(plan(&site(), &event, "refs/heads/master").is_empty());
        assert_eq!(plan(&site(), &event, "refs/heads/main").len(), 1);
    }

    #[test]
    fn ignored_push_succeeds_without_running_anything() {
        let task = Task {
            target: "restart-hook-no-such-user:/nonexistent".parse().unwrap(),
            event: Arc::new(parse_event(r#"{"ref":"refs/heads/develop"}"#)),
        };
        assert!(restarter().process_task(task).is_ok());
    }

    #[test]
    fn failed_pull_fails_task() {
        let restarter = restarter();
        let target: RestartTarget = "restart-hook-no-such-user:/nonexistent".parse().unwrap();
        let task = Task {
            target: target.clone(),
            event: Arc::new(parse_event(
                r#"{"ref":"refs/heads/master","commits":[{"modified":["run.sh"]}]}"#,
            )),
        };

        let err = restarter.process_task(task).unwrap_err();
        assert!(err.to_string().contains("Failed to restart"), "{:?}", err);
        assert!(err.downcast_ref::<ShellError>().is_some());
        assert!(!restarter.lock_manager.is_running(&target));
    }

    fn as_current_user(program: &str, args: &[&str]) -> Invocation {
        let user = User::from_uid(getuid()).unwrap().unwrap();
        Invocation {
            user: user.name,
            dir: PathBuf::from("/"),
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "restart-hook-{}-{}",
            std::process::id(),
            name
        ));
        std::fs::remove_dir_all(&dir).ok();
        dir
    }

    fn mkdir(dir: &Path) -> Invocation {
        let dir = dir.to_string_lossy();
        as_current_user("mkdir", &["-p", &*dir])
    }

    #[test]
    fn failed_kill_still_pulls() {
        let pulled = scratch_dir("pulled");
        let steps = [
            PlannedStep {
                step: Step::KillScript,
                invocation: as_current_user("false", &[]),
            },
            PlannedStep {
                step: Step::Pull,
                invocation: mkdir(&pulled),
            },
        ];

        run_steps(&site(), &steps).unwrap();
        assert!(pulled.is_dir());
        std::fs::remove_dir(&pulled).ok();
    }

    #[test]
    fn failed_pull_ends_run() {
        let after = scratch_dir("after-failed-pull");
        let steps = [
            PlannedStep {
                step: Step::Pull,
                invocation: as_current_user("false", &[]),
            },
            PlannedStep {
                step: Step::Pull,
                invocation: mkdir(&after),
            },
        ];

        let err = run_steps(&site(), &steps).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShellError>(),
            Some(ShellError::NonZeroExit { code: 1, .. })
        ));
        assert!(!after.exists());
    }

    #[test]
    fn merged_plans_keep_earlier_kill() {
        let event =
            parse_event(r#"{"ref":"refs/heads/master","commits":[{"modified":["run.sh"]}]}"#);
        let with_kill = plan(&site(), &event, "refs/heads/master");
        let pull_only = plan(
            &site(),
            &parse_event(r#"{"ref":"refs/heads/master"}"#),
            "refs/heads/master",
        );

        let merged = with_kill.clone().coalesce(pull_only.clone());
        assert_eq!(merged, with_kill);

        let merged = pull_only.clone().coalesce(pull_only.clone());
        assert_eq!(merged, pull_only);
    }

    fn hang_or_mark(target: &RestartTarget, _event: &PushEvent, _branch: &str) -> Vec<PlannedStep> {
        let invocation = if target.user == "hung" {
            as_current_user("sleep", &["10"])
        } else {
            mkdir(&target.path)
        };
        vec![PlannedStep {
            step: Step::Pull,
            invocation,
        }]
    }

    #[actix_web::test]
    async fn hung_target_does_not_starve_others() {
        let restarted = scratch_dir("qa-restarted");
        let lock_manager = Arc::new(LockManager::new());
        let addr = SyncArbiter::start(2, move || Restarter {
            watched_branch: "refs/heads/master".into(),
            lock_manager: lock_manager.clone(),
            planner: hang_or_mark,
        });

        let event = Arc::new(parse_event(r#"{"ref":"refs/heads/master"}"#));
        let hung: RestartTarget = "hung:/srv/hung".parse().unwrap();
        addr.do_send(Task {
            target: hung.clone(),
            event: event.clone(),
        });
        addr.do_send(Task {
            target: hung,
            event: event.clone(),
        });

        let qa = RestartTarget {
            user: "qa".into(),
            path: restarted.clone(),
        };
        let res = actix_web::rt::time::timeout(
            Duration::from_secs(5),
            addr.send(Task { target: qa, event }),
        )
        .await;
        assert!(matches!(res, Ok(Ok(Ok(())))), "{:?}", res);
        assert!(restarted.is_dir());
        std::fs::remove_dir(&restarted).ok();
    }
}
