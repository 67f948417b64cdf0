//! A [shell::Shell] that simulates releases instead of running programs.

use crate::shell::{self, Output, RESTART_SCRIPT, VERSION_SCRIPT};
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

/// A recorded command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub dir: PathBuf,
}

impl Invocation {
    /// Name used to match the command: the script for `bash`, otherwise the program.
    fn name(&self) -> &str {
        match (self.program.as_str(), self.args.first()) {
            ("bash", Some(script)) => script,
            (program, _) => program,
        }
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct State {
    invocations: Vec<Invocation>,
    versions: HashMap<PathBuf, String>,
    artifact_version: String,
    failures: HashMap<String, i32>,
    on_restart: Vec<Hook>,
}

/// Simulated host.
///
/// - `tar -zxf <archive> -C <dir>` "unpacks" a release reporting the artifact version.
/// - `bash version.sh` prints `Version: <version>` for any directory with a known release.
/// - `bash restart.sh <binary>` makes the release containing `<binary>` the running one.
#[derive(Clone, Default)]
pub struct Shell {
    state: Arc<Mutex<State>>,
}

impl Shell {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Prepare `dir` as the install path of a service running `version`.
    ///
    /// Writes placeholder `version.sh` and `restart.sh` scripts.
    pub fn install(&self, dir: &Path, version: &str) -> io::Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(VERSION_SCRIPT), format!("echo \"Version: {version}\"\n"))?;
        fs::write(dir.join(RESTART_SCRIPT), "exit 0\n")?;
        self.lock()
            .versions
            .insert(dir.to_path_buf(), version.to_string());
        Ok(())
    }

    /// Version reported by releases unpacked from now on.
    pub fn set_artifact_version(&self, version: &str) {
        self.lock().artifact_version = version.to_string();
    }

    /// Make every invocation of `name` (a program or script) exit with `code`.
    pub fn fail(&self, name: &str, code: i32) {
        self.lock().failures.insert(name.to_string(), code);
    }

    /// Run `hook` after every successful `restart.sh`.
    pub fn on_restart(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.lock().on_restart.push(Arc::new(hook));
    }

    /// Version currently reported by `dir`.
    pub fn version(&self, dir: &Path) -> Option<String> {
        self.lock().versions.get(dir).cloned()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().invocations.clone()
    }

    /// Number of invocations of `name` (a program or script).
    pub fn count(&self, name: &str) -> usize {
        self.lock()
            .invocations
            .iter()
            .filter(|i| i.name() == name)
            .count()
    }

    pub fn restarts(&self) -> usize {
        self.count(RESTART_SCRIPT)
    }

    fn unpack(state: &mut State, args: &[String]) -> Output {
        let Some(dir) = args
            .iter()
            .position(|a| a == "-C")
            .and_then(|i| args.get(i + 1))
        else {
            return failure(2, "tar: missing destination");
        };
        let dir = PathBuf::from(dir);
        let version = state.artifact_version.clone();
        let script = format!("echo \"Version: {version}\"\n");
        if let Err(err) = fs::write(dir.join(VERSION_SCRIPT), script) {
            return failure(2, &format!("tar: {err}"));
        }
        state.versions.insert(dir, version);
        success(String::new())
    }

    fn probe(state: &State, dir: &Path) -> Output {
        match state.versions.get(dir) {
            Some(version) => success(format!("Version: {version}\n")),
            None => failure(1, "unknown release"),
        }
    }

    fn restart(state: &mut State, args: &[String], dir: &Path) -> Output {
        let Some(binary) = args.get(1) else {
            return failure(1, "usage: restart.sh <binary>");
        };
        let release = Path::new(binary).parent().map(Path::to_path_buf);
        let Some(version) = release.and_then(|r| state.versions.get(&r).cloned()) else {
            return failure(1, "unknown binary");
        };
        state.versions.insert(dir.to_path_buf(), version);
        success(String::new())
    }
}

fn success(stdout: String) -> Output {
    Output {
        code: Some(0),
        stdout,
        stderr: String::new(),
    }
}

fn failure(code: i32, stderr: &str) -> Output {
    Output {
        code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

impl shell::Shell for Shell {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        dir: &Path,
    ) -> Result<Output, shell::Error> {
        let invocation = Invocation {
            program: program.to_string(),
            args: args.to_vec(),
            dir: dir.to_path_buf(),
        };
        let (output, hooks) = {
            let mut state = self.lock();
            let name = invocation.name().to_string();
            state.invocations.push(invocation);
            if let Some(code) = state.failures.get(&name) {
                return Ok(failure(*code, "mock failure"));
            }
            match name.as_str() {
                "tar" => (Self::unpack(&mut state, args), Vec::new()),
                VERSION_SCRIPT => (Self::probe(&state, dir), Vec::new()),
                RESTART_SCRIPT => {
                    let output = Self::restart(&mut state, args, dir);
                    let hooks = if output.success() {
                        state.on_restart.clone()
                    } else {
                        Vec::new()
                    };
                    (output, hooks)
                }
                _ => (failure(127, "command not found"), Vec::new()),
            }
        };
        for hook in hooks {
            hook();
        }
        Ok(output)
    }
}
