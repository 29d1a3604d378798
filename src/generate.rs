//! Turns parsed CLI arguments into the list of `JobSpec`s to run:
//! ports-tree/distfiles autodetection, port-list collection (CLI args,
//! `--file`, or the current directory), jail selection, and `-O`
//! option-combination enumeration.
//!
//! Grounded in `reprise.jobs.generate` (`discovery.py`, `options.py`,
//! `__init__.py`) and `reprise.jail.manager.JailManager`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::cli::Cli;
use crate::config::Config;
use crate::executor::{ExecOptions, Executor, ExecutorError};
use crate::types::{JailSpec, JobSpec, PackageCompressionMode};

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("'.' was given as a port but the current directory is not inside a port")]
    DotOutsidePort,
    #[error("failed to read option variables for {0}")]
    OptionVarsUnreadable(String),
    #[error("no jail named or tagged {0:?} is configured")]
    UnknownJail(String),
}

pub type GenerateResult<T> = Result<T, GenerateError>;

/// Autodetected defaults for the ports tree, distfiles directory, and
/// (if run from inside a port directory) the current port's origin.
struct Defaults {
    portsdir: PathBuf,
    distdir: PathBuf,
    current_port: Option<String>,
}

const FALLBACK_PORTSDIR: &str = "/usr/ports";

async fn discover_defaults(
    executor: &Executor,
    portsdir_arg: Option<&Path>,
    distdir_arg: Option<&Path>,
) -> GenerateResult<Defaults> {
    let mut portsdir = portsdir_arg.map(Path::to_path_buf);
    let mut current_port = None;

    if portsdir.is_none() && tokio::fs::try_exists("Makefile").await.unwrap_or(false) {
        let result = executor
            .execute(
                "generate::discover_portsdir",
                "make",
                &[
                    "-V".to_string(),
                    "PORTSDIR".to_string(),
                    "-V".to_string(),
                    "PORTNAME".to_string(),
                ],
                &ExecOptions::allow_failure(),
            )
            .await?;
        if result.stdout.len() == 2 && result.stdout.iter().all(|l| !l.is_empty()) {
            tracing::debug!("we seem to be in a port directory, using it");
            portsdir = Some(PathBuf::from(&result.stdout[0]));

            let cwd = std::env::current_dir()?;
            let components: Vec<String> = cwd
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            if components.len() >= 2 {
                current_port = Some(format!(
                    "{}/{}",
                    components[components.len() - 2],
                    components[components.len() - 1]
                ));
            }
        }
    }

    let portsdir = portsdir.unwrap_or_else(|| {
        tracing::debug!(portsdir = FALLBACK_PORTSDIR, "assumed default PORTSDIR");
        PathBuf::from(FALLBACK_PORTSDIR)
    });

    let distdir = match distdir_arg {
        Some(d) => d.to_path_buf(),
        None => {
            let result = executor
                .execute(
                    "generate::discover_distdir",
                    "make",
                    &[
                        "-C".to_string(),
                        portsdir.display().to_string(),
                        "-V".to_string(),
                        "DISTDIR".to_string(),
                    ],
                    &ExecOptions::allow_failure(),
                )
                .await?;
            result
                .stdout
                .first()
                .filter(|l| !l.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/usr/ports/distfiles"))
        }
    };

    Ok(Defaults {
        portsdir,
        distdir,
        current_port,
    })
}

/// Collects the set of port origins to build, in order: `--file`, then
/// positional `PORT…` (`.` expands to the current port), deduplicated;
/// falls back to the current port if neither yielded anything.
async fn collect_ports(cli: &Cli, defaults: &Defaults) -> GenerateResult<Vec<String>> {
    let mut seen = HashSet::new();
    let mut ports = Vec::new();

    if let Some(file) = &cli.file {
        let contents = if file == "-" {
            use std::io::Read;
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        } else {
            tokio::fs::read_to_string(file).await?
        };
        for line in contents.lines() {
            let item = line.split('#').next().unwrap_or("").trim();
            if !item.is_empty() && seen.insert(item.to_string()) {
                ports.push(item.to_string());
            }
        }
        tracing::debug!(count = ports.len(), "added port(s) from file");
    }

    let before_cli = ports.len();
    for port in &cli.ports {
        let resolved = if port == "." {
            defaults.current_port.clone().ok_or(GenerateError::DotOutsidePort)?
        } else {
            port.clone()
        };
        if seen.insert(resolved.clone()) {
            ports.push(resolved);
        }
    }
    tracing::debug!(count = ports.len() - before_cli, "added port(s) from the command line");

    if ports.is_empty() {
        if let Some(current) = &defaults.current_port {
            tracing::debug!(port = %current, "assuming to build current-directory port");
            ports.push(current.clone());
        }
    }

    Ok(ports)
}

/// Resolves `--jails` names/tags against `config.jails`; an empty
/// selector matches every configured jail.
fn resolve_jails(config: &Config, names: &[String]) -> GenerateResult<Vec<JailSpec>> {
    let all: Vec<JailSpec> = config
        .jails
        .iter()
        .map(|(name, jail)| JailSpec {
            name: name.clone(),
            version: jail.version.clone(),
            arch: jail.arch.clone(),
            tags: jail.tags.clone(),
        })
        .collect();

    if names.is_empty() {
        return Ok(all);
    }

    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for name in names {
        let matched: Vec<&JailSpec> = all
            .iter()
            .filter(|j| &j.name == name || j.tags.contains(name) || name == "all")
            .collect();
        if matched.is_empty() {
            return Err(GenerateError::UnknownJail(name.clone()));
        }
        for jail in matched {
            if seen.insert(jail.name.clone()) {
                result.push(jail.clone());
            }
        }
    }
    Ok(result)
}

const OPTIONS_GROUP_KINDS: &[&str] = &["OPTIONS_GROUP", "OPTIONS_SINGLE", "OPTIONS_MULTI", "OPTIONS_RADIO"];

/// Reads `OPTIONS_DEFAULT`/`OPTIONS_DEFINE`/group-kind variables (and
/// each group-kind's per-group member set) for the port at `path`.
async fn get_port_options_vars(
    executor: &Executor,
    path: &Path,
) -> GenerateResult<HashMap<String, HashSet<String>>> {
    let var_names = [
        "OPTIONS_DEFAULT",
        "OPTIONS_DEFINE",
        "OPTIONS_GROUP",
        "OPTIONS_SINGLE",
        "OPTIONS_MULTI",
        "OPTIONS_RADIO",
    ];

    let lines = query_vars(executor, path, &var_names).await?;
    if lines.len() != var_names.len() {
        return Err(GenerateError::OptionVarsUnreadable(path.display().to_string()));
    }

    let mut vars: HashMap<String, HashSet<String>> = var_names
        .iter()
        .zip(lines)
        .map(|(name, line)| (name.to_string(), line.split_whitespace().map(str::to_string).collect()))
        .collect();

    let sub_var_names: Vec<String> = OPTIONS_GROUP_KINDS
        .iter()
        .flat_map(|kind| vars[*kind].iter().map(move |sub| format!("{kind}_{sub}")))
        .collect();

    if !sub_var_names.is_empty() {
        let refs: Vec<&str> = sub_var_names.iter().map(String::as_str).collect();
        let lines = query_vars(executor, path, &refs).await?;
        if lines.len() != sub_var_names.len() {
            return Err(GenerateError::OptionVarsUnreadable(path.display().to_string()));
        }
        for (name, line) in sub_var_names.into_iter().zip(lines) {
            vars.insert(name, line.split_whitespace().map(str::to_string).collect());
        }
    }

    Ok(vars)
}

async fn query_vars(executor: &Executor, path: &Path, names: &[&str]) -> GenerateResult<Vec<String>> {
    let mut args = vec!["-C".to_string(), path.display().to_string()];
    for name in names {
        args.push(format!("-V{name}"));
    }
    Ok(executor
        .execute("generate::query_option_vars", "make", &args, &ExecOptions::default())
        .await?
        .stdout)
}

const ALWAYS_ENABLED: &[&str] = &["DOCS", "NLS", "EXAMPLES", "IPV6"];

/// Yields every raw option-toggle combination for the port's
/// `OPTIONS_DEFINE`/`_GROUP`/`_SINGLE`/`_RADIO`/`_MULTI` declarations.
/// Mirrors `options.py::_iterate_options_combinations`.
fn iterate_options_combinations(vars: &HashMap<String, HashSet<String>>) -> Vec<HashMap<String, bool>> {
    let mut out = Vec::new();
    let enabled: HashSet<String> = vars["OPTIONS_DEFAULT"]
        .union(&ALWAYS_ENABLED.iter().map(|s| s.to_string()).collect())
        .cloned()
        .collect();

    let mut defines: Vec<&String> = vars["OPTIONS_DEFINE"].iter().collect();
    defines.sort();
    for option in defines {
        out.push(HashMap::from([(option.clone(), true)]));
        out.push(HashMap::from([(option.clone(), false)]));
    }

    for group in &vars["OPTIONS_GROUP"] {
        let options = &vars[&format!("OPTIONS_GROUP_{group}")];
        let mut sorted: Vec<&String> = options.iter().collect();
        sorted.sort();
        for option in &sorted {
            out.push(HashMap::from([((*option).clone(), true)]));
            out.push(HashMap::from([((*option).clone(), false)]));
        }
        out.push(options.iter().map(|o| (o.clone(), true)).collect());
        out.push(options.iter().map(|o| (o.clone(), false)).collect());
    }

    for single in &vars["OPTIONS_SINGLE"] {
        let options = &vars[&format!("OPTIONS_SINGLE_{single}")];
        let mut sorted: Vec<&String> = options.iter().collect();
        sorted.sort();
        for choice in sorted {
            out.push(options.iter().map(|o| (o.clone(), o == choice)).collect());
        }
    }

    for radio in &vars["OPTIONS_RADIO"] {
        let options = &vars[&format!("OPTIONS_RADIO_{radio}")];
        let mut sorted: Vec<&String> = options.iter().collect();
        sorted.sort();
        for choice in &sorted {
            out.push(options.iter().map(|o| (o.clone(), o == *choice)).collect());
        }
        out.push(options.iter().map(|o| (o.clone(), false)).collect());
    }

    for multi in &vars["OPTIONS_MULTI"] {
        let options = &vars[&format!("OPTIONS_MULTI_{multi}")];
        let default: HashSet<&String> = options.intersection(&enabled).collect();
        let mut sorted: Vec<&String> = options.iter().collect();
        sorted.sort();
        for choice in &sorted {
            out.push(options.iter().map(|o| (o.clone(), o == *choice)).collect());
        }
        for option in &sorted {
            if HashSet::from([*option]) != default {
                out.push(HashMap::from([((*option).clone(), true)]));
                out.push(HashMap::from([((*option).clone(), false)]));
            }
        }
        out.push(options.iter().map(|o| (o.clone(), true)).collect());
    }

    out
}

/// Filters [`iterate_options_combinations`]'s raw output down to
/// combinations that actually change something from the port's
/// defaults, honoring `--include-options`/`--exclude-options`, and
/// deduplicates by the resulting (sorted) key set.
fn generate_options_combinations(
    vars: &HashMap<String, HashSet<String>>,
    include_options: Option<&HashSet<String>>,
    exclude_options: &HashSet<String>,
) -> Vec<HashMap<String, bool>> {
    let enabled: HashSet<String> = vars["OPTIONS_DEFAULT"]
        .union(&ALWAYS_ENABLED.iter().map(|s| s.to_string()).collect())
        .cloned()
        .collect();

    let is_good_option = |k: &str, v: bool| -> bool {
        let changed_from_default = v != enabled.contains(k);
        let includes_passed = include_options.is_none_or(|set| set.contains(k));
        let excludes_passed = !exclude_options.contains(k);
        changed_from_default && includes_passed && excludes_passed
    };

    let mut seen_keys = HashSet::new();
    let mut result = Vec::new();
    for combination in iterate_options_combinations(vars) {
        let filtered: HashMap<String, bool> = combination
            .into_iter()
            .filter(|(k, v)| is_good_option(k, *v))
            .collect();
        if filtered.is_empty() {
            continue;
        }
        let mut pairs: Vec<(String, bool)> = filtered.iter().map(|(k, v)| (k.clone(), *v)).collect();
        pairs.sort();
        let key = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",");
        if seen_keys.insert(key) {
            result.push(filtered);
        }
    }
    result
}

/// Expands the parsed CLI into the list of jobs to run: one per
/// `(jail, port, options-combination)` triple.
pub async fn generate_jobs(executor: &Executor, cli: &Cli, config: &Config) -> GenerateResult<Vec<JobSpec>> {
    let defaults = discover_defaults(executor, cli.portsdir.as_deref(), cli.distdir.as_deref()).await?;
    let ports = collect_ports(cli, &defaults).await?;

    let rebuild: HashSet<String> = cli.rebuild.iter().cloned().collect();
    let mut variables = HashMap::new();
    for var in &cli.vars {
        if let Some((k, v)) = var.split_once('=') {
            variables.insert(k.to_string(), v.to_string());
        }
    }

    let jailspecs = resolve_jails(config, &cli.jails)?;

    let mut jobs = Vec::new();
    for jailspec in &jailspecs {
        for port in &ports {
            let mut combinations: Vec<HashMap<String, bool>> = if cli.exclude_default_options {
                Vec::new()
            } else {
                vec![HashMap::new()]
            };

            if cli.options {
                let vars = get_port_options_vars(executor, &defaults.portsdir.join(port)).await?;
                let include: Option<HashSet<String>> =
                    (!cli.include_options.is_empty()).then(|| cli.include_options.iter().cloned().collect());
                let exclude: HashSet<String> = cli.exclude_options.iter().cloned().collect();
                combinations.extend(generate_options_combinations(&vars, include.as_ref(), &exclude));
                tracing::debug!(count = combinations.len(), "option combination(s) generated");
            }

            for options in combinations {
                jobs.push(JobSpec {
                    origin: port.clone(),
                    portsdir: defaults.portsdir.clone(),
                    distdir: defaults.distdir.clone(),
                    jailspec: jailspec.clone(),
                    origins_to_rebuild: rebuild.clone(),
                    do_test: !cli.no_test,
                    build_as_nobody: !cli.build_as_root,
                    use_ccache: !cli.no_ccache,
                    use_tmpfs_work: cli.tmpfs_work,
                    use_tmpfs_localbase: cli.tmpfs_localbase,
                    tmpfs_limit_bytes: cli.tmpfs_limit_mb * 1024 * 1024,
                    fail_fast: cli.fail_fast,
                    networking_build: cli.networking_build,
                    networking_test: cli.networking_test,
                    variables: variables.clone(),
                    options,
                    package_compression: cli.package_compression,
                    fetch_timeout_secs: cli.timeout_fetch,
                    build_timeout_secs: cli.timeout_build,
                    test_timeout_secs: cli.timeout_test,
                });
            }
        }
    }

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars_with(define: &[&str], default: &[&str]) -> HashMap<String, HashSet<String>> {
        let mut vars = HashMap::new();
        vars.insert("OPTIONS_DEFINE".to_string(), define.iter().map(|s| s.to_string()).collect());
        vars.insert("OPTIONS_DEFAULT".to_string(), default.iter().map(|s| s.to_string()).collect());
        for kind in ["OPTIONS_GROUP", "OPTIONS_SINGLE", "OPTIONS_MULTI", "OPTIONS_RADIO"] {
            vars.insert(kind.to_string(), HashSet::new());
        }
        vars
    }

    #[test]
    fn iterate_options_combinations_toggles_each_define() {
        let vars = vars_with(&["DOCS", "X11"], &["DOCS"]);
        let combos = iterate_options_combinations(&vars);
        assert!(combos.contains(&HashMap::from([("DOCS".to_string(), true)])));
        assert!(combos.contains(&HashMap::from([("DOCS".to_string(), false)])));
        assert!(combos.contains(&HashMap::from([("X11".to_string(), true)])));
        assert!(combos.contains(&HashMap::from([("X11".to_string(), false)])));
    }

    #[test]
    fn generate_options_combinations_drops_noop_toggles() {
        // DOCS is on by default (ALWAYS_ENABLED); toggling it ON is a no-op.
        let vars = vars_with(&["DOCS"], &[]);
        let combos = generate_options_combinations(&vars, None, &HashSet::new());
        assert_eq!(combos.len(), 1);
        assert_eq!(combos[0].get("DOCS"), Some(&false));
    }

    #[test]
    fn generate_options_combinations_honors_exclude() {
        let vars = vars_with(&["DOCS", "X11"], &[]);
        let exclude: HashSet<String> = HashSet::from(["X11".to_string()]);
        let combos = generate_options_combinations(&vars, None, &exclude);
        assert!(combos.iter().all(|c| !c.contains_key("X11")));
    }

    #[test]
    fn resolve_jails_matches_by_name_and_tag() {
        let mut config = Config::default();
        config.jails.insert(
            "140amd64".to_string(),
            crate::config::JailSpecConfig {
                version: "14.0-RELEASE".to_string(),
                arch: "amd64".to_string(),
                tags: vec!["stable".to_string()],
            },
        );
        config.jails.insert(
            "13i386".to_string(),
            crate::config::JailSpecConfig {
                version: "13.2-RELEASE".to_string(),
                arch: "i386".to_string(),
                tags: vec![],
            },
        );

        let by_tag = resolve_jails(&config, &["stable".to_string()]).unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].name, "140amd64");

        let all = resolve_jails(&config, &[]).unwrap();
        assert_eq!(all.len(), 2);

        assert!(resolve_jails(&config, &["nonexistent".to_string()]).is_err());
    }
}
