//! mysqldump process driver

use super::parser::{parse_stream, DumpItem, DumpParser};
use crate::canal::DumpConfig;
use crate::common::{CanalError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

static VERSION_EXP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:Distrib|Ver)\s+(\d+)\.(\d+)\.(\d+)").unwrap());

/// First MySQL release whose mysqldump understands `--source-data`.
const SOURCE_DATA_VERSION: (u32, u32, u32) = (8, 0, 26);

/// Runs mysqldump and streams the parsed output.
#[derive(Clone)]
pub struct Dumper {
    executable: PathBuf,
    addr: String,
    user: String,
    password: String,
    charset: String,
    config: DumpConfig,
    column_statistics: bool,
    source_data: bool,
}

impl std::fmt::Debug for Dumper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dumper")
            .field("executable", &self.executable)
            .field("addr", &self.addr)
            .field("user", &self.user)
            .field("source_data", &self.source_data)
            .finish_non_exhaustive()
    }
}

impl Dumper {
    /// Locate the executable and probe which flags it supports.
    ///
    /// Fails with `DumpUtilityNotFound` when the binary does not exist.
    pub async fn new(
        config: &DumpConfig,
        addr: &str,
        user: &str,
        password: &str,
        charset: &str,
    ) -> Result<Self> {
        let executable = find_executable(&config.executable_path)
            .ok_or_else(|| CanalError::DumpUtilityNotFound(config.executable_path.clone()))?;

        let help = probe(&executable, "--help").await?;
        let version = probe(&executable, "--version").await?;
        let source_data = supports_source_data(&version);
        debug!(
            executable = %executable.display(),
            version = %version.trim(),
            source_data,
            "probed mysqldump"
        );

        Ok(Self {
            executable,
            addr: addr.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            charset: charset.to_string(),
            config: config.clone(),
            column_statistics: help.contains("--column-statistics"),
            source_data,
        })
    }

    /// Whether the output carries binlog coordinates.
    pub fn parses_binlog_pos(&self) -> bool {
        !self.config.skip_master_data
    }

    /// Command line arguments, in the order they are passed.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(32);

        if self.addr.contains('/') {
            args.push(format!("--socket={}", self.addr));
        } else {
            let (host, port) = match self.addr.rsplit_once(':') {
                Some((host, port)) => (host, port),
                None => (self.addr.as_str(), "3306"),
            };
            args.push(format!("--host={}", host));
            args.push(format!("--port={}", port));
        }
        args.push(format!("--user={}", self.user));
        args.push(format!("--password={}", self.password));

        if !self.config.skip_master_data {
            args.push(if self.source_data {
                "--source-data".to_string()
            } else {
                "--master-data".to_string()
            });
        }
        if self.config.max_allowed_packet_mb > 0 {
            args.push(format!("--max-allowed-packet={}M", self.config.max_allowed_packet_mb));
        }
        if !self.config.protocol.is_empty() {
            args.push(format!("--protocol={}", self.config.protocol));
        }

        args.extend(
            [
                "--single-transaction",
                "--skip-lock-tables",
                "--compact",
                "--skip-opt",
                "--quick",
                "--no-create-info",
                "--skip-extended-insert",
                "--skip-tz-utc",
            ]
            .map(String::from),
        );
        if self.config.hex_blob {
            args.push("--hex-blob".to_string());
        }
        for (db, table) in self.config.ignore_table_pairs() {
            args.push(format!("--ignore-table={}.{}", db, table));
        }
        if !self.charset.is_empty() {
            args.push(format!("--default-character-set={}", self.charset));
        }
        if !self.config.where_clause.is_empty() {
            args.push(format!("--where={}", self.config.where_clause));
        }
        args.extend(self.config.extra_options.iter().cloned());
        if self.column_statistics {
            args.push("--column-statistics=0".to_string());
        }

        if !self.config.table_db.is_empty() && !self.config.tables.is_empty() {
            args.push(self.config.table_db.clone());
            args.extend(self.config.tables.iter().cloned());
        } else if !self.config.databases.is_empty() {
            args.push("--databases".to_string());
            args.extend(self.config.databases.iter().cloned());
        } else {
            args.push("--all-databases".to_string());
        }

        args
    }

    /// `args()` with the password masked.
    pub fn redacted_args(&self) -> Vec<String> {
        self.args()
            .into_iter()
            .map(|arg| {
                if arg.starts_with("--password=") {
                    "--password=******".to_string()
                } else {
                    arg
                }
            })
            .collect()
    }

    /// Single-table dumps print no `USE` line, so one is injected.
    fn preamble(&self) -> Option<String> {
        (!self.config.table_db.is_empty() && !self.config.tables.is_empty())
            .then(|| format!("USE `{}`;", self.config.table_db))
    }

    /// Start mysqldump.
    ///
    /// Items arrive on the returned receiver; the task resolves once the
    /// output is exhausted and the process has exited. Cancelling `cancel`
    /// or dropping the receiver kills the process.
    pub fn spawn(
        &self,
        cancel: CancellationToken,
    ) -> Result<(mpsc::Receiver<DumpItem>, JoinHandle<Result<u64>>)> {
        info!(args = ?self.redacted_args(), "running mysqldump");

        let mut child = Command::new(&self.executable)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(if self.config.discard_err {
                Stdio::null()
            } else {
                Stdio::inherit()
            })
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CanalError::dump(format!("failed to start {}: {}", self.executable.display(), e))
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CanalError::dump("mysqldump stdout is not captured"))?;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let mut parser = DumpParser::new(self.parses_binlog_pos());
        let preamble = self.preamble();

        let handle = tokio::spawn(async move {
            if let Some(line) = preamble {
                for item in parser.parse_line(&line)? {
                    tx.send(item).await.map_err(|_| CanalError::Cancelled)?;
                }
            }

            let parsed = tokio::select! {
                r = parse_stream(BufReader::new(stdout), &mut parser, &tx) => r,
                _ = cancel.cancelled() => Err(CanalError::Cancelled),
            };
            let lines = match parsed {
                Ok(lines) => lines,
                Err(e) => {
                    let _ = child.kill().await;
                    return Err(e);
                }
            };

            let status = child.wait().await?;
            if !status.success() {
                return Err(CanalError::dump(format!("mysqldump exited with {}", status)));
            }
            debug!(lines, "mysqldump finished");
            Ok(lines)
        });

        Ok((rx, handle))
    }
}

/// Resolve `name` like a shell would: paths must exist, bare names are
/// searched in `PATH`.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains('/') {
        let path = Path::new(name);
        return path.is_file().then(|| path.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

async fn probe(executable: &Path, flag: &str) -> Result<String> {
    let output = Command::new(executable)
        .arg(flag)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| CanalError::dump(format!("failed to run {} {}: {}", executable.display(), flag, e)))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// MySQL 8.0.26 renamed `--master-data` to `--source-data`; MariaDB kept
/// the old name.
pub fn supports_source_data(version_output: &str) -> bool {
    if version_output.contains("MariaDB") {
        return false;
    }
    // "Ver 10.13 Distrib 5.7.40" reports the server version after Distrib.
    let Some(caps) = VERSION_EXP.captures_iter(version_output).last() else {
        return false;
    };
    let part = |i: usize| caps[i].parse::<u32>().unwrap_or(0);
    (part(1), part(2), part(3)) >= SOURCE_DATA_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dumper(config: DumpConfig) -> Dumper {
        Dumper {
            executable: PathBuf::from("/usr/bin/mysqldump"),
            addr: "127.0.0.1:3306".into(),
            user: "root".into(),
            password: "secret".into(),
            charset: "utf8mb4".into(),
            config,
            column_statistics: false,
            source_data: false,
        }
    }

    const FIXED: [&str; 8] = [
        "--single-transaction",
        "--skip-lock-tables",
        "--compact",
        "--skip-opt",
        "--quick",
        "--no-create-info",
        "--skip-extended-insert",
        "--skip-tz-utc",
    ];

    #[test]
    fn test_args_all_databases() {
        let args = dumper(DumpConfig::default()).args();
        let mut expected: Vec<String> = [
            "--host=127.0.0.1",
            "--port=3306",
            "--user=root",
            "--password=secret",
            "--master-data",
        ]
        .map(String::from)
        .to_vec();
        expected.extend(FIXED.map(String::from));
        expected.extend(
            ["--hex-blob", "--default-character-set=utf8mb4", "--all-databases"].map(String::from),
        );
        assert_eq!(args, expected);
    }

    #[test]
    fn test_args_tables_and_options() {
        let mut d = dumper(DumpConfig {
            table_db: "shop".into(),
            tables: vec!["orders".into(), "items".into()],
            databases: vec!["ignored".into()],
            ignore_tables: vec!["shop,audit".into()],
            where_clause: "id > 10".into(),
            skip_master_data: true,
            max_allowed_packet_mb: 64,
            protocol: "tcp".into(),
            hex_blob: false,
            extra_options: vec!["--set-gtid-purged=OFF".into()],
            ..Default::default()
        });
        d.column_statistics = true;
        d.addr = "/var/run/mysqld/mysqld.sock".into();

        let args = d.args();
        assert_eq!(args[0], "--socket=/var/run/mysqld/mysqld.sock");
        assert!(!args.iter().any(|a| a.contains("master-data") || a.contains("source-data")));
        assert!(!args.contains(&"--hex-blob".to_string()));
        assert!(args.contains(&"--max-allowed-packet=64M".to_string()));
        assert!(args.contains(&"--protocol=tcp".to_string()));
        assert!(args.contains(&"--ignore-table=shop.audit".to_string()));
        assert!(args.contains(&"--where=id > 10".to_string()));
        assert_eq!(
            &args[args.len() - 5..],
            &["--set-gtid-purged=OFF", "--column-statistics=0", "shop", "orders", "items"]
        );
        assert_eq!(d.preamble().as_deref(), Some("USE `shop`;"));
        assert!(!d.parses_binlog_pos());
    }

    #[test]
    fn test_args_databases_with_source_data() {
        let mut d = dumper(DumpConfig {
            databases: vec!["a".into(), "b".into()],
            ..Default::default()
        });
        d.source_data = true;
        let args = d.args();
        assert!(args.contains(&"--source-data".to_string()));
        assert_eq!(&args[args.len() - 3..], &["--databases", "a", "b"]);
        assert_eq!(d.preamble(), None);
    }

    #[test]
    fn test_redacted_args() {
        let d = dumper(DumpConfig::default());
        let redacted = d.redacted_args();
        assert!(redacted.contains(&"--password=******".to_string()));
        assert!(!redacted.iter().any(|a| a.contains("secret")));
        assert!(!format!("{:?}", d).contains("secret"));
    }

    #[test]
    fn test_supports_source_data() {
        assert!(supports_source_data(
            "mysqldump  Ver 8.0.32 for Linux on x86_64 (MySQL Community Server - GPL)"
        ));
        assert!(supports_source_data("mysqldump  Ver 8.4.0 for Linux on aarch64"));
        assert!(!supports_source_data("mysqldump  Ver 8.0.25 for Linux on x86_64"));
        assert!(!supports_source_data(
            "mysqldump  Ver 10.13 Distrib 5.7.40, for Linux (x86_64)"
        ));
        assert!(!supports_source_data(
            "mysqldump  Ver 10.19 Distrib 10.6.12-MariaDB, for debian-linux-gnu (x86_64)"
        ));
        assert!(!supports_source_data("garbage"));
    }

    #[test]
    fn test_find_executable() {
        assert_eq!(find_executable(""), None);
        assert_eq!(find_executable("/definitely/not/here/mysqldump"), None);
        assert_eq!(find_executable("mycanal-no-such-binary-on-path"), None);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-dump");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        assert_eq!(find_executable(path.to_str().unwrap()), Some(path));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_streams_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("mysqldump");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             echo \"CHANGE MASTER TO MASTER_LOG_FILE='mysql-bin.000003', MASTER_LOG_POS=120;\"\n\
             echo 'INSERT INTO `orders` VALUES (1,'\"'\"'a'\"'\"');'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut d = dumper(DumpConfig {
            table_db: "shop".into(),
            tables: vec!["orders".into()],
            ..Default::default()
        });
        d.executable = script;

        let (mut rx, handle) = d.spawn(CancellationToken::new()).unwrap();
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        assert_eq!(handle.await.unwrap().unwrap(), 2);
        assert_eq!(
            items,
            vec![
                DumpItem::BinlogPosition(crate::mysql::Position::new("mysql-bin.000003", 120)),
                DumpItem::Row {
                    schema: "shop".into(),
                    table: "orders".into(),
                    values: vec!["1".into(), "'a'".into()],
                },
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_reports_exit_status() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("mysqldump");
        std::fs::write(&script, "#!/bin/sh\nexit 2\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut d = dumper(DumpConfig::default());
        d.executable = script;
        let (mut rx, handle) = d.spawn(CancellationToken::new()).unwrap();
        assert!(rx.recv().await.is_none());
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, CanalError::Dump(_)));
    }
}
