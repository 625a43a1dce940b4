//! Task Execution
//!
//! Runs one attempt of one job. The scheduler never touches processes
//! directly; it hands a [`JobRequest`] to a [`TaskExecutor`] on a blocking
//! worker and receives an [`ExecutionOutcome`] back.
//!
//! The shipped [`ShellExecutor`] handles:
//! - Output directory creation
//! - Script generation (`bash`, `set -euo pipefail`)
//! - Log capture (stdout and stderr appended to the job log)
//! - Shadow directories for jobs that must not see partial state

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::Local;
use log::{debug, warn};

use crate::config::ENGINE_DIR;
use crate::error::{ExecutorError, JobFailure};
use crate::workflow::graph::{missing_outputs, Job, JobId};
use crate::workflow::resources::ResourceRequest;
use crate::workflow::wildcards::WildcardBinding;

/// One dispatch attempt of a job, fully resolved.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job: JobId,
    pub label: String,
    pub template: String,
    pub binding: WildcardBinding,
    /// Command with every placeholder substituted.
    pub command: String,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub log: PathBuf,
    pub resources: ResourceRequest,
    pub attempt: u32,
    /// Directory relative paths resolve against.
    pub working_dir: PathBuf,
    pub shadow: bool,
}

impl JobRequest {
    /// Builds the request for the job's current attempt.
    pub fn new(job: &Job, command: String, resources: ResourceRequest, working_dir: &Path) -> Self {
        Self {
            job: job.id,
            label: job.label(),
            template: job.template.id.clone(),
            binding: job.binding.clone(),
            command,
            inputs: job.inputs.clone(),
            outputs: job.outputs.clone(),
            log: job.log.clone(),
            resources,
            attempt: job.attempt,
            working_dir: working_dir.to_path_buf(),
            shadow: job.template.shadow,
        }
    }
}

/// What an executor observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Declared outputs found on disk afterwards.
    pub outputs: Vec<PathBuf>,
    pub log: PathBuf,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs a job attempt to completion.
///
/// Implementations are called from a blocking worker thread and may block.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, request: &JobRequest) -> Result<ExecutionOutcome, ExecutorError>;
}

/// Values available to command placeholders.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext<'a> {
    pub inputs: &'a [PathBuf],
    pub outputs: &'a [PathBuf],
    pub log: &'a Path,
    pub binding: &'a WildcardBinding,
    pub params: &'a BTreeMap<String, String>,
    pub resources: &'a ResourceRequest,
    pub attempt: u32,
}

impl<'a> CommandContext<'a> {
    pub fn for_job(job: &'a Job, resources: &'a ResourceRequest) -> Self {
        Self {
            inputs: &job.inputs,
            outputs: &job.outputs,
            log: &job.log,
            binding: &job.binding,
            params: &job.template.executor.params,
            resources,
            attempt: job.attempt,
        }
    }
}

/// Substitutes command placeholders.
///
/// Supported placeholders:
/// - `{input}` / `{output}`: space-separated paths
/// - `{input[N]}` / `{output[N]}`: the N-th path
/// - `{log}`, `{threads}`, `{mem_mb}`, `{runtime}`, `{attempt}`
/// - `{wildcards.NAME}`, `{params.NAME}`
///
/// `{{` and `}}` produce literal braces.
pub fn render_command(template: &str, ctx: &CommandContext<'_>) -> Result<String, JobFailure> {
    let mut rendered = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                rendered.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                rendered.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                if !closed {
                    return Err(command_error(format!("unclosed placeholder '{{{}'", name)));
                }
                rendered.push_str(&resolve_placeholder(name.trim(), ctx)?);
            }
            '}' => return Err(command_error("unmatched '}' in command".to_string())),
            _ => rendered.push(c),
        }
    }

    Ok(rendered)
}

fn resolve_placeholder(name: &str, ctx: &CommandContext<'_>) -> Result<String, JobFailure> {
    match name {
        "input" => return Ok(join_paths(ctx.inputs)),
        "output" => return Ok(join_paths(ctx.outputs)),
        "log" => return Ok(ctx.log.display().to_string()),
        "threads" => return Ok(ctx.resources.threads.to_string()),
        "mem_mb" => return Ok(ctx.resources.mem_mb.to_string()),
        "runtime" => return Ok(ctx.resources.runtime_min.to_string()),
        "attempt" => return Ok(ctx.attempt.to_string()),
        _ => {}
    }

    if let Some(wildcard) = name.strip_prefix("wildcards.") {
        return ctx
            .binding
            .get(wildcard)
            .map(str::to_string)
            .ok_or_else(|| command_error(format!("wildcard '{}' is not bound", wildcard)));
    }
    if let Some(param) = name.strip_prefix("params.") {
        return ctx
            .params
            .get(param)
            .cloned()
            .ok_or_else(|| command_error(format!("unknown param '{}'", param)));
    }
    if let Some((list, index)) = indexed(name) {
        let paths = if list == "input" { ctx.inputs } else { ctx.outputs };
        return paths
            .get(index)
            .map(|p| p.display().to_string())
            .ok_or_else(|| {
                command_error(format!(
                    "{{{}}} out of range ({} {}s)",
                    name,
                    paths.len(),
                    list
                ))
            });
    }

    Err(command_error(format!("unknown placeholder '{{{}}}'", name)))
}

/// Parses `input[N]` / `output[N]`.
fn indexed(name: &str) -> Option<(&str, usize)> {
    let (list, rest) = name.split_once('[')?;
    if list != "input" && list != "output" {
        return None;
    }
    let index = rest.strip_suffix(']')?.trim().parse().ok()?;
    Some((list, index))
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn command_error(message: String) -> JobFailure {
    JobFailure::CommandTemplate { message }
}

/// Checks that every declared output exists and is non-empty.
pub fn verify_outputs(base_dir: &Path, outputs: &[PathBuf]) -> Result<(), JobFailure> {
    let missing = missing_outputs(base_dir, outputs);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(JobFailure::MissingOutput { paths: missing })
    }
}

/// Runs jobs as `bash` scripts.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl TaskExecutor for ShellExecutor {
    fn execute(&self, request: &JobRequest) -> Result<ExecutionOutcome, ExecutorError> {
        let base = fs::canonicalize(&request.working_dir)?;

        ensure_output_directories(&request.outputs, &base)?;
        let mut log = open_log(&base.join(&request.log))?;
        writeln!(
            log,
            "# {} attempt {} started {}",
            request.label,
            request.attempt,
            Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;
        writeln!(log, "# {}", request.command)?;

        let run_dir = if request.shadow {
            prepare_shadow(&base, request)?
        } else {
            base.clone()
        };

        let script_path = create_execution_script(&base, request)?;
        let status = Command::new("bash")
            .arg(&script_path)
            .current_dir(&run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log.try_clone()?))
            .status();

        if let Err(e) = fs::remove_file(&script_path) {
            warn!("Failed to clean up script {}: {}", script_path.display(), e);
        }

        if request.shadow {
            let moved = collect_shadow_outputs(&run_dir, &base, &request.outputs);
            if let Err(e) = fs::remove_dir_all(&run_dir) {
                warn!("Failed to remove shadow directory {}: {}", run_dir.display(), e);
            }
            moved?;
        }

        let status = status?;
        debug!("{} exited with {:?}", request.label, status.code());
        writeln!(log, "# exit status {:?}", status.code())?;

        let produced = request
            .outputs
            .iter()
            .filter(|o| base.join(o).exists())
            .cloned()
            .collect();

        Ok(ExecutionOutcome {
            exit_code: status.code(),
            outputs: produced,
            log: request.log.clone(),
        })
    }
}

/// Creates parent directories for output files.
fn ensure_output_directories(outputs: &[PathBuf], base: &Path) -> Result<(), ExecutorError> {
    for output in outputs {
        if let Some(parent) = base.join(output).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                debug!("Created directory: {}", parent.display());
            }
        }
    }
    Ok(())
}

fn open_log(path: &Path) -> Result<File, ExecutorError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Writes the job script under the engine directory.
fn create_execution_script(base: &Path, request: &JobRequest) -> Result<PathBuf, ExecutorError> {
    let script_dir = base.join(ENGINE_DIR).join("scripts").join(&request.template);
    fs::create_dir_all(&script_dir)?;

    let script_path = script_dir.join(format!(
        "{}.attempt{}.sh",
        request.binding.slug(),
        request.attempt
    ));
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -euo pipefail")?;
    writeln!(file, "{}", request.command)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

fn shadow_error(path: &Path) -> impl FnOnce(std::io::Error) -> ExecutorError + '_ {
    move |source| ExecutorError::Shadow {
        path: path.to_path_buf(),
        source,
    }
}

/// Creates a private directory with the job's inputs linked in.
fn prepare_shadow(base: &Path, request: &JobRequest) -> Result<PathBuf, ExecutorError> {
    let shadow = base
        .join(ENGINE_DIR)
        .join("shadow")
        .join(format!("{}-{}", request.template, request.binding.slug()));

    if shadow.exists() {
        fs::remove_dir_all(&shadow).map_err(shadow_error(&shadow))?;
    }
    fs::create_dir_all(&shadow).map_err(shadow_error(&shadow))?;

    for input in &request.inputs {
        let source = base.join(input);
        let link = shadow.join(input);
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent).map_err(shadow_error(parent))?;
        }
        link_input(&source, &link).map_err(shadow_error(&link))?;
    }
    for output in &request.outputs {
        if let Some(parent) = shadow.join(output).parent() {
            fs::create_dir_all(parent).map_err(shadow_error(parent))?;
        }
    }

    debug!("Shadow directory for {}: {}", request.label, shadow.display());
    Ok(shadow)
}

#[cfg(unix)]
fn link_input(source: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, link)
}

#[cfg(not(unix))]
fn link_input(source: &Path, link: &Path) -> std::io::Result<()> {
    fs::copy(source, link).map(|_| ())
}

/// Moves declared outputs from the shadow directory back into place.
fn collect_shadow_outputs(shadow: &Path, base: &Path, outputs: &[PathBuf]) -> Result<(), ExecutorError> {
    for output in outputs {
        let produced = shadow.join(output);
        if !produced.exists() {
            continue;
        }
        let destination = base.join(output);
        if destination.is_dir() {
            fs::remove_dir_all(&destination).map_err(shadow_error(&destination))?;
        } else if destination.exists() {
            fs::remove_file(&destination).map_err(shadow_error(&destination))?;
        }
        fs::rename(&produced, &destination).map_err(shadow_error(&produced))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources() -> ResourceRequest {
        ResourceRequest {
            mem_mb: 4000,
            runtime_min: 30,
            threads: 4,
        }
    }

    fn ctx<'a>(
        inputs: &'a [PathBuf],
        outputs: &'a [PathBuf],
        binding: &'a WildcardBinding,
        params: &'a BTreeMap<String, String>,
        resources: &'a ResourceRequest,
    ) -> CommandContext<'a> {
        CommandContext {
            inputs,
            outputs,
            log: Path::new("logs/a.log"),
            binding,
            params,
            resources,
            attempt: 2,
        }
    }

    #[test]
    fn test_render_command_placeholders() {
        let inputs = vec![PathBuf::from("a.fq"), PathBuf::from("b.fq")];
        let outputs = vec![PathBuf::from("out.bam")];
        let binding = WildcardBinding::new().with("sample", "S1");
        let mut params = BTreeMap::new();
        params.insert("ref".to_string(), "hg38.fa".to_string());
        let res = resources();
        let ctx = ctx(&inputs, &outputs, &binding, &params, &res);

        let rendered = render_command(
            "bwa mem -t {threads} {params.ref} {input} > {output} 2> {log} # {wildcards.sample} {mem_mb} {runtime} {attempt}",
            &ctx,
        )
        .unwrap();
        assert_eq!(
            rendered,
            "bwa mem -t 4 hg38.fa a.fq b.fq > out.bam 2> logs/a.log # S1 4000 30 2"
        );

        assert_eq!(render_command("cp {input[1]} {output[0]}", &ctx).unwrap(), "cp b.fq out.bam");
        assert_eq!(
            render_command("awk '{{print $1}}' {input[0]}", &ctx).unwrap(),
            "awk '{print $1}' a.fq"
        );
    }

    #[test]
    fn test_render_command_errors() {
        let inputs = vec![PathBuf::from("a.fq")];
        let outputs = vec![];
        let binding = WildcardBinding::new();
        let params = BTreeMap::new();
        let res = resources();
        let ctx = ctx(&inputs, &outputs, &binding, &params, &res);

        for bad in [
            "echo {unknown}",
            "echo {input[3]}",
            "echo {wildcards.sample}",
            "echo {params.x}",
            "echo {input",
            "echo }",
        ] {
            assert!(
                matches!(render_command(bad, &ctx), Err(JobFailure::CommandTemplate { .. })),
                "{} should fail",
                bad
            );
        }
    }

    #[test]
    fn test_verify_outputs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("full.txt"), "x").unwrap();
        std::fs::write(dir.path().join("empty.txt"), "").unwrap();

        assert!(verify_outputs(dir.path(), &[PathBuf::from("full.txt")]).is_ok());
        match verify_outputs(
            dir.path(),
            &[PathBuf::from("empty.txt"), PathBuf::from("gone.txt")],
        ) {
            Err(JobFailure::MissingOutput { paths }) => assert_eq!(paths.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn request(dir: &Path, command: &str, shadow: bool) -> JobRequest {
        JobRequest {
            job: 0,
            label: "demo(sample=S1)".into(),
            template: "demo".into(),
            binding: WildcardBinding::new().with("sample", "S1"),
            command: command.into(),
            inputs: vec![PathBuf::from("raw/in.txt")],
            outputs: vec![PathBuf::from("out/S1/result.txt")],
            log: PathBuf::from("logs/demo/S1.log"),
            resources: resources(),
            attempt: 1,
            working_dir: dir.to_path_buf(),
            shadow,
        }
    }

    #[test]
    fn test_shell_executor_runs_command() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("raw")).unwrap();
        std::fs::write(dir.path().join("raw/in.txt"), "hello").unwrap();

        let req = request(
            dir.path(),
            "cat raw/in.txt > out/S1/result.txt && echo done",
            false,
        );
        let outcome = ShellExecutor::new().execute(&req).unwrap();

        assert!(outcome.success());
        assert_eq!(outcome.outputs, vec![PathBuf::from("out/S1/result.txt")]);
        let log = std::fs::read_to_string(dir.path().join("logs/demo/S1.log")).unwrap();
        assert!(log.contains("done"));
        assert!(log.contains("attempt 1"));
        let scripts = dir.path().join(ENGINE_DIR).join("scripts/demo");
        assert!(scripts.is_dir());
        assert!(!scripts.join("sample-S1.attempt1.sh").exists());
    }

    #[test]
    fn test_script_named_by_sorted_binding() {
        let dir = tempfile::tempdir().unwrap();
        let script = format!("{}/scripts/demo/run-R1_sample-S1.attempt2.sh", ENGINE_DIR);

        let mut req = request(
            dir.path(),
            &format!("test -f {} && echo ok > out/S1/result.txt", script),
            false,
        );
        req.binding = WildcardBinding::new().with("sample", "S1").with("run", "R1");
        req.attempt = 2;
        let outcome = ShellExecutor::new().execute(&req).unwrap();

        assert!(outcome.success());
        assert!(!dir.path().join(&script).exists());
    }

    #[test]
    fn test_shell_executor_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "echo broken >&2; exit 3", false);
        let outcome = ShellExecutor::new().execute(&req).unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.outputs.is_empty());
        let log = std::fs::read_to_string(dir.path().join("logs/demo/S1.log")).unwrap();
        assert!(log.contains("broken"));
    }

    #[test]
    fn test_pipefail_catches_failed_producer() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "false | cat > out/S1/result.txt", false);
        let outcome = ShellExecutor::new().execute(&req).unwrap();
        assert!(!outcome.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_shadow_execution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("raw")).unwrap();
        std::fs::write(dir.path().join("raw/in.txt"), "hello").unwrap();

        let req = request(
            dir.path(),
            "test -L raw/in.txt && cat raw/in.txt > out/S1/result.txt && touch scratch.tmp",
            true,
        );
        let outcome = ShellExecutor::new().execute(&req).unwrap();

        assert!(outcome.success());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/S1/result.txt")).unwrap(),
            "hello"
        );
        assert!(!dir.path().join("scratch.tmp").exists());
        assert!(!dir.path().join(ENGINE_DIR).join("shadow/demo-sample-S1").exists());
    }
}
