//! Render step fields against the environment at execution time.
//!
//! Available variables: `user`, `home`, `workdir`, `path`, `invoking_user`
//! and `vars.<NAME>`. Undefined variables are errors.

use anyhow::{Context, Result};
use minijinja::{UndefinedBehavior, context};

use super::environment::Environment;
use super::step::{Action, Invocation, Listing, Step};

pub struct Renderer {
    jinja: minijinja::Environment<'static>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        let mut jinja = minijinja::Environment::new();
        jinja.set_undefined_behavior(UndefinedBehavior::Strict);
        jinja.set_keep_trailing_newline(true);
        Self { jinja }
    }

    pub fn render(&self, text: &str, env: &Environment) -> Result<String> {
        if !text.contains("{{") && !text.contains("{%") {
            return Ok(text.to_string());
        }
        self.jinja
            .render_str(
                text,
                context! {
                    user => &env.user,
                    home => env.home.display().to_string(),
                    workdir => env.workdir.display().to_string(),
                    path => env.path_string(),
                    invoking_user => &env.invoking_user,
                    vars => &env.vars,
                },
            )
            .with_context(|| format!("render template '{text}'"))
    }

    /// Render every string field of `step` against `env`.
    pub fn render_step(&self, step: &Step, env: &Environment) -> Result<Step> {
        let s = |text: &str| self.render(text, env);
        let list = |items: &[String]| -> Result<Vec<String>> {
            items.iter().map(|item| s(item)).collect()
        };
        let opt = |value: &Option<String>| -> Result<Option<String>> {
            value.as_deref().map(|v| s(v)).transpose()
        };
        let inv = |invocation: &Invocation| -> Result<Invocation> {
            Ok(Invocation {
                program: s(&invocation.program)?,
                args: list(&invocation.args)?,
            })
        };

        let action = match &step.action {
            Action::Packages { manager, packages } => Action::Packages {
                manager: *manager,
                packages: list(packages)?,
            },
            Action::AddRepository {
                manager,
                repository,
                url,
            } => Action::AddRepository {
                manager: *manager,
                repository: s(repository)?,
                url: s(url)?,
            },
            Action::Download { url, dest } => Action::Download {
                url: s(url)?,
                dest: s(dest)?,
            },
            Action::Installer {
                url,
                args,
                interpreter,
            } => Action::Installer {
                url: s(url)?,
                args: list(args)?,
                interpreter: s(interpreter)?,
            },
            Action::Clone {
                url,
                dest,
                reference,
            } => Action::Clone {
                url: s(url)?,
                dest: s(dest)?,
                reference: opt(reference)?,
            },
            Action::Copy { from, to, owner } => Action::Copy {
                from: s(from)?,
                to: s(to)?,
                owner: opt(owner)?,
            },
            Action::Build { command } => Action::Build {
                command: inv(command)?,
            },
            Action::Register { command, verify } => Action::Register {
                command: inv(command)?,
                verify: match verify {
                    Some(listing) => Some(Listing {
                        command: inv(&listing.command)?,
                        contains: s(&listing.contains)?,
                    }),
                    None => None,
                },
            },
            Action::CreateUser { user, home, shell } => Action::CreateUser {
                user: s(user)?,
                home: opt(home)?,
                shell: s(shell)?,
            },
            Action::GrantSudo { user, commands } => Action::GrantSudo {
                user: s(user)?,
                commands: list(commands)?,
            },
            Action::SwitchUser { user } => Action::SwitchUser { user: s(user)? },
            Action::PrependPath { dir } => Action::PrependPath { dir: s(dir)? },
            Action::SetEnv { key, value } => Action::SetEnv {
                key: key.clone(),
                value: s(value)?,
            },
            Action::ChangeDir { dir } => Action::ChangeDir { dir: s(dir)? },
            Action::Run { command } => Action::Run {
                command: inv(command)?,
            },
        };

        Ok(Step {
            name: step.name.clone(),
            action,
            workdir: opt(&step.workdir)?,
            privilege: step.privilege,
            expected_exit: step.expected_exit,
            timeout_secs: step.timeout_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn env() -> Environment {
        let mut env = Environment::new("root", "/root", "/", vec![PathBuf::from("/usr/bin")]);
        env.add_account("analyst", "/home/analyst").expect("add");
        env
    }

    #[test]
    fn plain_text_is_untouched() {
        let out = Renderer::new().render("make all", &env()).expect("render");
        assert_eq!(out, "make all");
    }

    #[test]
    fn home_follows_active_user() {
        let renderer = Renderer::new();
        let mut env = env();
        let before = renderer
            .render("{{ home }}/.opam/4.07.1/bin", &env)
            .expect("render");
        env.switch_user("analyst").expect("switch");
        let after = renderer
            .render("{{ home }}/.opam/4.07.1/bin", &env)
            .expect("render");
        assert_eq!(before, "/root/.opam/4.07.1/bin");
        assert_eq!(after, "/home/analyst/.opam/4.07.1/bin");
    }

    #[test]
    fn vars_are_addressable() {
        let mut env = env();
        env.set_var("OCAML_VERSION", "4.07.1").expect("set");
        let out = Renderer::new()
            .render("opam switch create {{ vars.OCAML_VERSION }}", &env)
            .expect("render");
        assert_eq!(out, "opam switch create 4.07.1");
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let err = Renderer::new()
            .render("{{ vars.MISSING }}", &env())
            .unwrap_err();
        assert!(format!("{err:#}").contains("render template"));
    }

    #[test]
    fn render_step_renders_nested_fields() {
        let step = Step::new(
            "plugin-src",
            Action::Clone {
                url: "https://example.test/plugin.git".to_string(),
                dest: "{{ home }}/plugin".to_string(),
                reference: Some("{{ user }}".to_string()),
            },
        );
        let rendered = Renderer::new().render_step(&step, &env()).expect("render");
        assert_eq!(
            rendered.action,
            Action::Clone {
                url: "https://example.test/plugin.git".to_string(),
                dest: "/root/plugin".to_string(),
                reference: Some("root".to_string()),
            }
        );
    }
}
