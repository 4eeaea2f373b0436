//! The launch state machine.
//!
//! `Start -> ResolvePaths -> ValidateRuntime -> BuildEnvironment ->
//! InitEmbeddedRuntime -> Dispatch -> {Success, Failure}`. Every state runs at
//! most once, and the first error ends the run in `Failure`.

use std::{ffi::OsString, path::PathBuf};

use clickspeak_core::{
    identity::CLICKSPEAK,
    paths,
    settings::{self, LaunchMode},
    AppIdentity, LaunchError, LaunchSettings, RuntimeInstallation,
};
use clickspeak_observability::{safe_eprintln, Span, Tracer};
use serde_json::{json, Value};

use crate::{
    embed::{embedded_argv, EmbeddedRuntime, EntryPoint, RuntimeConfig},
    environment::{EnvironmentInputs, LaunchEnvironment},
    notify::UserNotifier,
};

pub const TRACE_COMPONENT: &str = "launcher";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Start,
    ResolvePaths,
    ValidateRuntime,
    BuildEnvironment,
    InitEmbeddedRuntime,
    Dispatch,
    Success,
    Failure,
}

impl LaunchState {
    pub fn step(self) -> &'static str {
        match self {
            Self::Start => "launch.start",
            Self::ResolvePaths => "launch.resolve_paths",
            Self::ValidateRuntime => "launch.validate_runtime",
            Self::BuildEnvironment => "launch.build_environment",
            Self::InitEmbeddedRuntime => "launch.init_runtime",
            Self::Dispatch => "launch.dispatch",
            Self::Success => "launch.success",
            Self::Failure => "launch.failure",
        }
    }
}

/// Everything the launcher reads from the outside world, gathered up front.
#[derive(Debug, Clone, Default)]
pub struct LaunchInputs {
    pub home: Option<PathBuf>,
    pub runtime_override: Option<PathBuf>,
    pub project_override: Option<PathBuf>,
    pub data_dir_override: Option<PathBuf>,
    pub inherited_path: Option<OsString>,
    pub executable: Option<PathBuf>,
}

impl LaunchInputs {
    pub fn from_process() -> Self {
        Self {
            home: paths::home_dir().ok(),
            runtime_override: paths::env_path(paths::RUNTIME_DIR_ENV),
            project_override: paths::env_path(paths::PROJECT_DIR_ENV),
            data_dir_override: paths::env_path(paths::DATA_DIR_ENV),
            inherited_path: std::env::var_os("PATH"),
            executable: std::env::current_exe().ok(),
        }
    }

    /// Where traces and panic logs go; `None` without a home or override.
    pub fn data_dir(&self) -> Option<PathBuf> {
        match (&self.data_dir_override, &self.home) {
            (Some(dir), _) => Some(dir.clone()),
            (None, Some(home)) => Some(paths::data_dir(home, None)),
            (None, None) => None,
        }
    }

    fn resources_dir(&self) -> Option<PathBuf> {
        self.executable
            .as_deref()
            .and_then(settings::resources_dir_for)
    }
}

#[derive(Debug)]
pub struct LaunchOutcome {
    pub exit_code: i32,
    /// States entered, in order, ending in `Success` or `Failure`.
    pub states: Vec<LaunchState>,
    pub error: Option<LaunchError>,
    pub environment: Option<LaunchEnvironment>,
}

impl LaunchOutcome {
    pub fn final_state(&self) -> LaunchState {
        self.states.last().copied().unwrap_or(LaunchState::Start)
    }

    /// The state whose work failed.
    pub fn failed_at(&self) -> Option<LaunchState> {
        if self.final_state() != LaunchState::Failure {
            return None;
        }
        self.states.iter().rev().nth(1).copied()
    }

    pub fn reached(&self, state: LaunchState) -> bool {
        self.states.contains(&state)
    }
}

#[derive(Debug)]
struct ResolvedPaths {
    runtime: RuntimeInstallation,
    project: Option<PathBuf>,
    settings: LaunchSettings,
    bundled_source: Option<PathBuf>,
}

fn error_kind(err: &LaunchError) -> &'static str {
    match err {
        LaunchError::NoHome => "config",
        LaunchError::RuntimeUnavailable { .. }
        | LaunchError::RuntimeNotProvisioned { .. }
        | LaunchError::HeadersMissing { .. } => "runtime",
        LaunchError::RuntimeInitFailed(_) => "embed",
        LaunchError::EntryPointFailed(_) => "app",
    }
}

fn finish<T>(span: Span, result: Result<T, LaunchError>, ctx: Option<Value>) -> Result<T, LaunchError> {
    match &result {
        Ok(_) => span.ok(ctx),
        Err(e) => span.err(error_kind(e), e.code(), &e.to_string(), ctx),
    }
    result
}

pub struct Launcher<R, N> {
    identity: AppIdentity,
    inputs: LaunchInputs,
    runtime: R,
    notifier: N,
    tracer: Tracer,
}

impl<R: EmbeddedRuntime, N: UserNotifier> Launcher<R, N> {
    pub fn new(inputs: LaunchInputs, runtime: R, notifier: N) -> Self {
        let tracer = match inputs.data_dir() {
            Some(dir) => Tracer::new(dir, TRACE_COMPONENT),
            None => Tracer::disabled(TRACE_COMPONENT),
        };
        Self {
            identity: CLICKSPEAK,
            inputs,
            runtime,
            notifier,
            tracer,
        }
    }

    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Runs the whole launch; `process_argv[0]` is the launcher's own path.
    pub fn run<I>(&mut self, process_argv: I) -> LaunchOutcome
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        let mut states = vec![LaunchState::Start];
        let mut environment = None;
        self.tracer.event(
            LaunchState::Start.step(),
            "ok",
            Some(json!({
                "app": self.identity.name,
                "version": self.identity.version,
            })),
        );

        let argv: Vec<OsString> = process_argv.into_iter().map(Into::into).collect();
        match self.drive(argv, &mut states, &mut environment) {
            Ok(()) => {
                states.push(LaunchState::Success);
                self.tracer.event(LaunchState::Success.step(), "ok", None);
                LaunchOutcome {
                    exit_code: 0,
                    states,
                    error: None,
                    environment,
                }
            }
            Err(err) => {
                self.report(&err);
                states.push(LaunchState::Failure);
                self.tracer.event(
                    LaunchState::Failure.step(),
                    "err",
                    Some(json!({ "code": err.code() })),
                );
                LaunchOutcome {
                    exit_code: 1,
                    states,
                    error: Some(err),
                    environment,
                }
            }
        }
    }

    fn enter(&self, states: &mut Vec<LaunchState>, state: LaunchState) -> Span {
        states.push(state);
        self.tracer.span(state.step(), None)
    }

    fn drive(
        &mut self,
        argv: Vec<OsString>,
        states: &mut Vec<LaunchState>,
        environment: &mut Option<LaunchEnvironment>,
    ) -> Result<(), LaunchError> {
        let span = self.enter(states, LaunchState::ResolvePaths);
        let resolved = self.resolve_paths();
        let ctx = resolved.as_ref().ok().map(|r| {
            json!({
                "runtime": r.runtime.root(),
                "project": r.project,
                "mode": r.settings.mode,
            })
        });
        let resolved = finish(span, resolved, ctx)?;

        let span = self.enter(states, LaunchState::ValidateRuntime);
        finish(span, resolved.runtime.ensure_ready(), None)?;

        let span = self.enter(states, LaunchState::BuildEnvironment);
        let env = finish(span, self.build_environment(&resolved), None)?;
        *environment = Some(env);

        let span = self.enter(states, LaunchState::InitEmbeddedRuntime);
        let config = RuntimeConfig::for_installation(&resolved.runtime);
        let init = self.runtime.initialize(&config);
        finish(span, init, Some(json!({ "executable": config.executable })))?;

        let span = self.enter(states, LaunchState::Dispatch);
        let entry = EntryPoint::from_settings(&resolved.settings);
        let argv = embedded_argv(argv, self.identity.display_name);
        let result = self
            .runtime
            .install_argv(&argv)
            .and_then(|()| self.runtime.run_entry_point(&entry));
        if let Err(e) = self.runtime.finalize() {
            self.tracer.event(
                "launch.finalize",
                "err",
                Some(json!({ "error": e.to_string() })),
            );
        }
        finish(
            span,
            result,
            Some(json!({
                "module": entry.module,
                "function": entry.function,
                "argc": argv.len(),
            })),
        )
    }

    fn load_settings(&self) -> LaunchSettings {
        let Some(resources) = self.inputs.resources_dir() else {
            return LaunchSettings::default();
        };
        match settings::load_settings(&resources) {
            Ok(s) => s,
            Err(e) => {
                self.tracer.event(
                    "launch.settings",
                    "err",
                    Some(json!({
                        "path": settings::settings_path(&resources),
                        "error": format!("{e:#}"),
                    })),
                );
                LaunchSettings::default()
            }
        }
    }

    fn resolve_paths(&self) -> Result<ResolvedPaths, LaunchError> {
        let home = self.inputs.home.as_deref().ok_or(LaunchError::NoHome)?;
        let settings = self.load_settings();
        let runtime = RuntimeInstallation::at(paths::resolve_runtime_dir(
            home,
            self.inputs.runtime_override.clone(),
        ));
        let project = paths::resolve_project_dir(
            home,
            self.inputs.project_override.clone(),
            settings.probes_project(),
        );
        let bundled_source = match (settings.mode, &settings.bundled_source) {
            (LaunchMode::Release, Some(rel)) => self.inputs.resources_dir().map(|r| r.join(rel)),
            _ => None,
        };
        Ok(ResolvedPaths {
            runtime,
            project,
            settings,
            bundled_source,
        })
    }

    fn build_environment(&self, resolved: &ResolvedPaths) -> Result<LaunchEnvironment, LaunchError> {
        let env = LaunchEnvironment::build(&EnvironmentInputs {
            identity: &self.identity,
            runtime: &resolved.runtime,
            project: resolved.project.as_deref(),
            bundled_source: resolved.bundled_source.as_deref(),
            executable: self.inputs.executable.as_deref(),
            inherited_path: self.inputs.inherited_path.as_ref(),
        })?;
        if let Err(e) = env.apply() {
            self.tracer.event(
                "launch.chdir",
                "err",
                Some(json!({
                    "dir": env.working_dir,
                    "error": e.to_string(),
                })),
            );
        }
        Ok(env)
    }

    /// Entry-point failures are the application's own to present; everything
    /// else gets a dialog.
    fn report(&self, err: &LaunchError) {
        safe_eprintln!("{}: {err}", self.identity.name);
        if matches!(err, LaunchError::EntryPointFailed(_)) {
            return;
        }
        let message = err.user_message(self.identity.display_name);
        if let Err(e) = self.notifier.notify(&message) {
            safe_eprintln!("{}: could not show error dialog: {e:#}", self.identity.name);
            self.tracer.event(
                "launch.notify",
                "err",
                Some(json!({ "error": format!("{e:#}") })),
            );
        }
    }
}
