//! Capability interfaces for the external collaborators a plan drives.
//!
//! Each trait covers one concern (system/language packages, source
//! acquisition, building, accounts). [`ShellTools`] implements all of them by
//! issuing commands through a [`CommandRunner`]; tests can swap in scripted
//! runners or fake individual capabilities.
//!
//! Multi-command operations stop at the first command that does not exit 0
//! and return that command's outcome.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::environment::{Environment, SudoGrant};
use crate::core::privilege::sudoers_entry;
use crate::core::step::{Invocation, PackageManager, Privilege};
use crate::io::runner::{CommandOutcome, CommandRequest, CommandRunner};

/// Per-step execution context handed to capabilities.
#[derive(Debug, Clone)]
pub struct StepContext<'a> {
    pub env: &'a Environment,
    pub privilege: Privilege,
    pub workdir: PathBuf,
    /// Every command the step issues must finish by this instant.
    pub deadline: Instant,
    pub output_limit_bytes: usize,
    pub log_path: Option<PathBuf>,
}

/// Timeout for housekeeping commands issued after a step's own commands.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

impl StepContext<'_> {
    /// Request for `invocation`, limited to what is left before the deadline.
    pub fn request(&self, invocation: Invocation) -> CommandRequest {
        CommandRequest {
            invocation,
            env: self.env.clone(),
            privilege: self.privilege,
            workdir: self.workdir.clone(),
            stdin: None,
            timeout: self.remaining(),
            output_limit_bytes: self.output_limit_bytes,
            log_path: self.log_path.clone(),
        }
    }

    /// Request that runs even when the step has used up its time.
    pub fn cleanup_request(&self, invocation: Invocation) -> CommandRequest {
        let mut request = self.request(invocation);
        request.timeout = CLEANUP_TIMEOUT;
        request
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Same context with a different privilege level.
    pub fn with_privilege(&self, privilege: Privilege) -> Self {
        Self {
            privilege,
            ..self.clone()
        }
    }
}

pub trait PackageInstaller {
    fn install(
        &self,
        manager: PackageManager,
        packages: &[String],
        ctx: &StepContext<'_>,
    ) -> Result<CommandOutcome>;

    fn add_repository(
        &self,
        manager: PackageManager,
        name: &str,
        url: &str,
        ctx: &StepContext<'_>,
    ) -> Result<CommandOutcome>;
}

pub trait RepositoryFetcher {
    fn download(&self, url: &str, dest: &Path, ctx: &StepContext<'_>) -> Result<CommandOutcome>;

    fn clone_repository(
        &self,
        url: &str,
        dest: &Path,
        reference: Option<&str>,
        ctx: &StepContext<'_>,
    ) -> Result<CommandOutcome>;

    /// Copy a local tree, then hand it to `owner` when given.
    fn copy_tree(
        &self,
        from: &Path,
        to: &Path,
        owner: Option<&str>,
        ctx: &StepContext<'_>,
    ) -> Result<CommandOutcome>;
}

pub trait Builder {
    fn build(&self, command: &Invocation, ctx: &StepContext<'_>) -> Result<CommandOutcome>;

    fn register(&self, command: &Invocation, ctx: &StepContext<'_>) -> Result<CommandOutcome>;

    /// Run the platform's listing command; callers inspect stdout.
    fn list_registered(&self, command: &Invocation, ctx: &StepContext<'_>)
    -> Result<CommandOutcome>;
}

pub trait AccountManager {
    fn create_user(
        &self,
        user: &str,
        home: &Path,
        shell: &str,
        ctx: &StepContext<'_>,
    ) -> Result<CommandOutcome>;

    fn grant_passwordless(
        &self,
        user: &str,
        grant: &SudoGrant,
        ctx: &StepContext<'_>,
    ) -> Result<CommandOutcome>;
}

/// Run a housekeeping command. Failures are logged, never reported.
pub fn cleanup(runner: &dyn CommandRunner, request: &CommandRequest) {
    match runner.run(request) {
        Ok(outcome) if outcome.succeeded(0) => {}
        Ok(outcome) => {
            warn!(
                command = %outcome.command,
                exit_code = ?outcome.exit_code,
                "cleanup failed"
            );
        }
        Err(err) => {
            let message = format!("{err:#}");
            warn!(err = %message, "cleanup could not run");
        }
    }
}

/// Capability set the provisioner works against.
#[derive(Clone, Copy)]
pub struct Toolbox<'a> {
    pub runner: &'a dyn CommandRunner,
    pub packages: &'a dyn PackageInstaller,
    pub fetcher: &'a dyn RepositoryFetcher,
    pub builder: &'a dyn Builder,
    pub accounts: &'a dyn AccountManager,
}

impl<'a> Toolbox<'a> {
    pub fn from_shell<R: CommandRunner + 'a>(tools: &'a ShellTools<R>) -> Self {
        Self {
            runner: tools.runner(),
            packages: tools,
            fetcher: tools,
            builder: tools,
            accounts: tools,
        }
    }
}

/// Production capabilities implemented with standard command-line tools.
pub struct ShellTools<R> {
    runner: R,
    sudoers_dir: PathBuf,
}

impl<R: CommandRunner> ShellTools<R> {
    pub fn new(runner: R, sudoers_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            sudoers_dir: sudoers_dir.into(),
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn run_sequence(&self, requests: Vec<CommandRequest>) -> Result<CommandOutcome> {
        let mut last = None;
        for request in requests {
            let outcome = self.runner.run(&request)?;
            if !outcome.succeeded(0) {
                debug!(
                    command = %outcome.command,
                    exit_code = ?outcome.exit_code,
                    "sequence stopped"
                );
                return Ok(outcome);
            }
            last = Some(outcome);
        }
        last.ok_or_else(|| anyhow!("empty command sequence"))
    }
}

impl<R: CommandRunner> PackageInstaller for ShellTools<R> {
    #[instrument(skip_all, fields(manager = manager.as_str(), count = packages.len()))]
    fn install(
        &self,
        manager: PackageManager,
        packages: &[String],
        ctx: &StepContext<'_>,
    ) -> Result<CommandOutcome> {
        let requests = match manager {
            PackageManager::Apt => vec![
                ctx.request(Invocation::new("apt-get", ["-y", "-q", "update"])),
                ctx.request(
                    Invocation::new("apt-get", ["-y", "-q", "install", "--no-install-recommends"])
                        .with_args(packages.iter().cloned()),
                ),
            ],
            PackageManager::Opam => vec![ctx.request(
                Invocation::new("opam", ["install", "-y"]).with_args(packages.iter().cloned()),
            )],
        };
        self.run_sequence(requests)
    }

    #[instrument(skip_all, fields(manager = manager.as_str(), name = name))]
    fn add_repository(
        &self,
        manager: PackageManager,
        name: &str,
        url: &str,
        ctx: &StepContext<'_>,
    ) -> Result<CommandOutcome> {
        let requests = match manager {
            PackageManager::Apt => vec![
                ctx.request(Invocation::new("add-apt-repository", ["-y", url])),
                ctx.request(Invocation::new("apt-get", ["-y", "-q", "update"])),
            ],
            PackageManager::Opam => vec![
                ctx.request(Invocation::new("opam", ["repo", "add", "--yes", name, url])),
                ctx.request(Invocation::new("opam", ["update"])),
            ],
        };
        self.run_sequence(requests)
    }
}

impl<R: CommandRunner> RepositoryFetcher for ShellTools<R> {
    #[instrument(skip_all, fields(url = url))]
    fn download(&self, url: &str, dest: &Path, ctx: &StepContext<'_>) -> Result<CommandOutcome> {
        let dest = dest.display().to_string();
        let request = ctx.request(Invocation::new(
            "curl",
            ["-fsSL", "--retry", "3", "-o", dest.as_str(), url],
        ));
        self.runner.run(&request)
    }

    #[instrument(skip_all, fields(url = url, reference = ?reference))]
    fn clone_repository(
        &self,
        url: &str,
        dest: &Path,
        reference: Option<&str>,
        ctx: &StepContext<'_>,
    ) -> Result<CommandOutcome> {
        let mut invocation = Invocation::new("git", ["clone", "--depth", "1"]);
        if let Some(reference) = reference {
            invocation = invocation.with_args(["--branch", reference]);
        }
        let invocation = invocation.with_args([url.to_string(), dest.display().to_string()]);
        self.runner.run(&ctx.request(invocation))
    }

    #[instrument(skip_all, fields(owner = ?owner))]
    fn copy_tree(
        &self,
        from: &Path,
        to: &Path,
        owner: Option<&str>,
        ctx: &StepContext<'_>,
    ) -> Result<CommandOutcome> {
        let to_display = to.display().to_string();
        let from_display = from.display().to_string();
        let mut requests = vec![ctx.request(Invocation::new(
            "cp",
            ["-a", from_display.as_str(), to_display.as_str()],
        ))];
        if let Some(owner) = owner {
            let chown = ctx.with_privilege(Privilege::Elevated);
            let spec = format!("{owner}:");
            requests.push(chown.request(Invocation::new(
                "chown",
                ["-R", spec.as_str(), to_display.as_str()],
            )));
        }
        self.run_sequence(requests)
    }
}

impl<R: CommandRunner> Builder for ShellTools<R> {
    fn build(&self, command: &Invocation, ctx: &StepContext<'_>) -> Result<CommandOutcome> {
        self.runner.run(&ctx.request(command.clone()))
    }

    fn register(&self, command: &Invocation, ctx: &StepContext<'_>) -> Result<CommandOutcome> {
        self.runner.run(&ctx.request(command.clone()))
    }

    fn list_registered(
        &self,
        command: &Invocation,
        ctx: &StepContext<'_>,
    ) -> Result<CommandOutcome> {
        self.runner.run(&ctx.request(command.clone()))
    }
}

impl<R: CommandRunner> AccountManager for ShellTools<R> {
    #[instrument(skip_all, fields(user = user))]
    fn create_user(
        &self,
        user: &str,
        home: &Path,
        shell: &str,
        ctx: &StepContext<'_>,
    ) -> Result<CommandOutcome> {
        let home = home.display().to_string();
        let request = ctx.request(Invocation::new(
            "useradd",
            ["--create-home", "--home-dir", home.as_str(), "--shell", shell, user],
        ));
        self.runner.run(&request)
    }

    /// Stage the sudoers entry under a name sudo ignores, have `visudo`
    /// check it, then move it into place. A rejected entry is removed so it
    /// never reaches the live drop-in directory.
    #[instrument(skip_all, fields(user = user))]
    fn grant_passwordless(
        &self,
        user: &str,
        grant: &SudoGrant,
        ctx: &StepContext<'_>,
    ) -> Result<CommandOutcome> {
        let target = self.sudoers_dir.join(user).display().to_string();
        // `#includedir` skips file names containing a dot.
        let staged = self
            .sudoers_dir
            .join(format!("{user}.pending"))
            .display()
            .to_string();
        let mut write = ctx.request(Invocation::new("tee", [staged.as_str()]));
        write.stdin = Some(sudoers_entry(user, grant).into_bytes());
        let requests = vec![
            write,
            ctx.request(Invocation::new("chmod", ["0440", staged.as_str()])),
            ctx.request(Invocation::new("visudo", ["-c", "-f", staged.as_str()])),
            ctx.request(Invocation::new("mv", ["-f", staged.as_str(), target.as_str()])),
        ];
        let outcome = self.run_sequence(requests)?;
        if !outcome.succeeded(0) {
            let remove = ctx.cleanup_request(Invocation::new("rm", ["-f", staged.as_str()]));
            cleanup(&self.runner, &remove);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedRunner, base_env};

    fn ctx(env: &Environment) -> StepContext<'_> {
        StepContext {
            env,
            privilege: Privilege::Elevated,
            workdir: PathBuf::from("/"),
            deadline: Instant::now() + Duration::from_secs(60),
            output_limit_bytes: 1000,
            log_path: None,
        }
    }

    #[test]
    fn apt_install_updates_then_installs() {
        let env = base_env();
        let tools = ShellTools::new(ScriptedRunner::succeeding(), "/etc/sudoers.d");
        tools
            .install(
                PackageManager::Apt,
                &["m4".to_string(), "curl".to_string()],
                &ctx(&env),
            )
            .expect("install");

        assert_eq!(
            tools.runner().commands(),
            vec![
                "apt-get -y -q update",
                "apt-get -y -q install --no-install-recommends m4 curl"
            ]
        );
    }

    #[test]
    fn failed_update_stops_before_install() {
        let env = base_env();
        let runner = ScriptedRunner::succeeding().fail_when("apt-get -y -q update", 100);
        let tools = ShellTools::new(runner, "/etc/sudoers.d");
        let outcome = tools
            .install(PackageManager::Apt, &["m4".to_string()], &ctx(&env))
            .expect("install");

        assert_eq!(outcome.exit_code, Some(100));
        assert_eq!(tools.runner().commands(), vec!["apt-get -y -q update"]);
    }

    #[test]
    fn opam_repository_add_then_update() {
        let env = base_env();
        let tools = ShellTools::new(ScriptedRunner::succeeding(), "/etc/sudoers.d");
        tools
            .add_repository(
                PackageManager::Opam,
                "bap",
                "git+https://github.com/BinaryAnalysisPlatform/opam-repository",
                &ctx(&env),
            )
            .expect("add repo");
        assert_eq!(
            tools.runner().commands(),
            vec![
                "opam repo add --yes bap git+https://github.com/BinaryAnalysisPlatform/opam-repository",
                "opam update"
            ]
        );
    }

    #[test]
    fn grant_stages_checks_then_installs_entry() {
        let env = base_env();
        let tools = ShellTools::new(ScriptedRunner::succeeding(), "/etc/sudoers.d");
        tools
            .grant_passwordless("analyst", &SudoGrant::All, &ctx(&env))
            .expect("grant");

        let requests = tools.runner().requests();
        assert_eq!(
            tools.runner().commands(),
            vec![
                "tee /etc/sudoers.d/analyst.pending",
                "chmod 0440 /etc/sudoers.d/analyst.pending",
                "visudo -c -f /etc/sudoers.d/analyst.pending",
                "mv -f /etc/sudoers.d/analyst.pending /etc/sudoers.d/analyst",
            ]
        );
        assert_eq!(
            requests[0].stdin.as_deref(),
            Some(b"analyst ALL=(ALL) NOPASSWD:ALL\n".as_slice())
        );
        assert!(requests.iter().all(|r| r.privilege == Privilege::Elevated));
    }

    #[test]
    fn rejected_grant_never_reaches_the_drop_in_directory() {
        let env = base_env();
        let runner = ScriptedRunner::succeeding().fail_when("visudo", 1);
        let tools = ShellTools::new(runner, "/etc/sudoers.d");
        let outcome = tools
            .grant_passwordless("analyst", &SudoGrant::All, &ctx(&env))
            .expect("grant");

        assert_eq!(outcome.exit_code, Some(1));
        assert_eq!(outcome.command, "visudo -c -f /etc/sudoers.d/analyst.pending");
        let commands = tools.runner().commands();
        assert_eq!(
            commands.last().map(String::as_str),
            Some("rm -f /etc/sudoers.d/analyst.pending")
        );
        assert!(!tools.runner().ran("mv"), "{commands:?}");
    }

    #[test]
    fn requests_share_the_step_deadline() {
        let env = base_env();
        let mut context = ctx(&env);
        context.deadline = Instant::now() + Duration::from_secs(10);
        let first = context.request(Invocation::new("apt-get", ["update"]));
        std::thread::sleep(Duration::from_millis(50));
        let second = context.request(Invocation::new("apt-get", ["install"]));
        assert!(first.timeout <= Duration::from_secs(10));
        assert!(second.timeout < first.timeout);

        context.deadline = Instant::now();
        let late = context.request(Invocation::new("true", Vec::<String>::new()));
        assert_eq!(late.timeout, Duration::ZERO);
        assert_eq!(
            context.cleanup_request(Invocation::new("rm", ["-f", "x"])).timeout,
            CLEANUP_TIMEOUT
        );
    }

    #[test]
    fn copy_with_owner_chowns_elevated() {
        let env = base_env();
        let tools = ShellTools::new(ScriptedRunner::succeeding(), "/etc/sudoers.d");
        let normal = ctx(&env).with_privilege(Privilege::Normal);
        tools
            .copy_tree(
                Path::new("/src/plugin"),
                Path::new("/home/analyst/plugin"),
                Some("analyst"),
                &normal,
            )
            .expect("copy");

        let requests = tools.runner().requests();
        assert_eq!(requests[0].privilege, Privilege::Normal);
        assert_eq!(
            requests[1].invocation.to_string(),
            "chown -R analyst: /home/analyst/plugin"
        );
        assert_eq!(requests[1].privilege, Privilege::Elevated);
    }
}
