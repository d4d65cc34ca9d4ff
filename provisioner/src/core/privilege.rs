//! Translate (active identity, privilege) into the argv actually spawned.
//!
//! All `sudo` calls are non-interactive (`-n`): a missing grant fails the
//! step instead of hanging on a password prompt.

use std::collections::BTreeMap;

use super::environment::{Environment, SudoGrant};
use super::step::{Invocation, Privilege};

/// Fully resolved process launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub program: String,
    pub args: Vec<String>,
    /// Variables set on the spawned process itself.
    pub env: BTreeMap<String, String>,
}

/// Build the launch for `invocation` under `env`.
///
/// - Active user is the invoking user: run directly, or `sudo -n` when elevated.
/// - Active user differs: hop with `sudo -n -u <user> -H env K=V...` so the
///   threaded variables survive sudo's environment reset. Elevated commands
///   then go through a second `sudo -n` issued by the active user, which is
///   what exercises that user's passwordless grant.
///
/// Elevated commands run with sudo's sanitized environment; scoped sudoers
/// grants only match the real program, not an `env` wrapper.
pub fn launch_for(
    invocation: &Invocation,
    env: &Environment,
    privilege: Privilege,
    sudo: &str,
) -> Launch {
    let vars = env.exported_vars();
    let elevated = privilege == Privilege::Elevated && env.user != "root";

    if !env.is_switched() {
        if !elevated {
            return Launch {
                program: invocation.program.clone(),
                args: invocation.args.clone(),
                env: vars,
            };
        }
        let mut args = vec!["-n".to_string()];
        args.extend(invocation.argv());
        return Launch {
            program: sudo.to_string(),
            args,
            env: vars,
        };
    }

    let mut args = vec![
        "-n".to_string(),
        "-u".to_string(),
        env.user.clone(),
        "-H".to_string(),
    ];
    if elevated {
        args.push(sudo.to_string());
        args.push("-n".to_string());
    } else {
        args.push("env".to_string());
        args.extend(vars.iter().map(|(key, value)| format!("{key}={value}")));
    }
    args.extend(invocation.argv());
    Launch {
        program: sudo.to_string(),
        args,
        env: vars,
    }
}

/// Sudoers drop-in line granting passwordless execution.
pub fn sudoers_entry(user: &str, grant: &SudoGrant) -> String {
    match grant {
        SudoGrant::All => format!("{user} ALL=(ALL) NOPASSWD:ALL\n"),
        SudoGrant::Commands(commands) => {
            format!("{user} ALL=(ALL) NOPASSWD: {}\n", commands.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn env_as(invoking: &str) -> Environment {
        Environment::new(
            invoking,
            format!("/home/{invoking}"),
            "/work",
            vec![PathBuf::from("/usr/bin")],
        )
    }

    fn apt() -> Invocation {
        Invocation::new("apt-get", ["install", "-y", "m4"])
    }

    #[test]
    fn normal_step_as_invoking_user_runs_directly() {
        let env = env_as("builder");
        let launch = launch_for(&apt(), &env, Privilege::Normal, "sudo");
        assert_eq!(launch.program, "apt-get");
        assert_eq!(launch.args, vec!["install", "-y", "m4"]);
        assert_eq!(launch.env["PATH"], "/usr/bin");
    }

    #[test]
    fn elevated_step_as_root_skips_sudo() {
        let env = env_as("root");
        let launch = launch_for(&apt(), &env, Privilege::Elevated, "sudo");
        assert_eq!(launch.program, "apt-get");
    }

    #[test]
    fn elevated_step_as_plain_user_uses_non_interactive_sudo() {
        let env = env_as("builder");
        let launch = launch_for(&apt(), &env, Privilege::Elevated, "sudo");
        assert_eq!(launch.program, "sudo");
        assert_eq!(launch.args, vec!["-n", "apt-get", "install", "-y", "m4"]);
    }

    #[test]
    fn switched_user_forwards_threaded_variables() {
        let mut env = env_as("root");
        env.add_account("analyst", "/home/analyst").expect("add");
        env.switch_user("analyst").expect("switch");
        env.prepend_path("/home/analyst/.opam/4.07/bin").expect("path");

        let launch = launch_for(
            &Invocation::new("make", ["all"]),
            &env,
            Privilege::Normal,
            "sudo",
        );
        assert_eq!(launch.program, "sudo");
        assert_eq!(&launch.args[..5], &["-n", "-u", "analyst", "-H", "env"]);
        assert!(
            launch
                .args
                .contains(&"PATH=/home/analyst/.opam/4.07/bin:/usr/bin".to_string())
        );
        assert_eq!(&launch.args[launch.args.len() - 2..], &["make", "all"]);
    }

    #[test]
    fn switched_user_elevation_goes_through_own_sudo() {
        let mut env = env_as("root");
        env.add_account("analyst", "/home/analyst").expect("add");
        env.switch_user("analyst").expect("switch");

        let launch = launch_for(&apt(), &env, Privilege::Elevated, "sudo");
        assert_eq!(
            launch.args,
            vec![
                "-n", "-u", "analyst", "-H", "sudo", "-n", "apt-get", "install", "-y", "m4"
            ]
        );
    }

    #[test]
    fn sudoers_entries_are_passwordless() {
        assert_eq!(
            sudoers_entry("analyst", &SudoGrant::All),
            "analyst ALL=(ALL) NOPASSWD:ALL\n"
        );
        assert_eq!(
            sudoers_entry(
                "analyst",
                &SudoGrant::Commands(vec!["/usr/bin/apt-get".to_string(), "/bin/chown".to_string()])
            ),
            "analyst ALL=(ALL) NOPASSWD: /usr/bin/apt-get, /bin/chown\n"
        );
    }
}
