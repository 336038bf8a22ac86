//! Backend driving the broker's bundled admin tools
//!
//! Runs `<prefix>.configs` for SCRAM users and `<prefix>.acls` for ACLs, with
//! `KAFKA_OPTS` pointing the JVM at the JAAS file.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use broker_core::types::{AclEntry, AclOperation, PatternType, ResourceType};

use super::{AuthBackend, CommandOutcome};

/// Stderr fragments meaning the dependency service is not reachable yet
const TRANSIENT_MARKERS: &[&str] = &[
    "Timed out waiting for connection",
    "ConnectionLoss",
    "Connection refused",
    "KeeperErrorCode = NoAuth",
    "SessionExpired",
];

/// Where the admin tools live and how they are invoked
#[derive(Debug, Clone)]
pub struct ToolsConfig {
    /// Command prefix, e.g. `charmed-kafka` for `charmed-kafka.configs`
    pub bin_prefix: String,
    /// Directory holding `server.properties`, passed as the ZooKeeper TLS config
    pub config_dir: PathBuf,
    /// Values joined into `KAFKA_OPTS`
    pub opts: Vec<String>,
}

/// [`AuthBackend`] shelling out to the broker admin tools
#[derive(Debug, Clone)]
pub struct KafkaToolsBackend {
    config: ToolsConfig,
}

impl KafkaToolsBackend {
    pub fn new(config: ToolsConfig) -> Self {
        Self { config }
    }

    fn tls_config_arg(&self) -> String {
        format!(
            "--zk-tls-config-file={}",
            self.config.config_dir.join("server.properties").display()
        )
    }

    /// Arguments adding or updating a SCRAM user
    pub fn upsert_user_args(&self, zookeeper: &str, username: &str, password: &str) -> Vec<String> {
        vec![
            format!("--zookeeper={}", zookeeper),
            "--alter".to_string(),
            "--entity-type=users".to_string(),
            format!("--entity-name={}", username),
            format!("--add-config=SCRAM-SHA-512=[password={}]", password),
            self.tls_config_arg(),
        ]
    }

    pub fn delete_user_args(&self, zookeeper: &str, username: &str) -> Vec<String> {
        vec![
            format!("--zookeeper={}", zookeeper),
            "--alter".to_string(),
            "--entity-type=users".to_string(),
            format!("--entity-name={}", username),
            "--delete-config=SCRAM-SHA-512".to_string(),
            self.tls_config_arg(),
        ]
    }

    /// Arguments adding (`add`) or removing one ACL entry
    pub fn acl_args(&self, zookeeper: &str, acl: &AclEntry, add: bool) -> Vec<String> {
        let mut args = vec![format!("--authorizer-properties=zookeeper.connect={}", zookeeper)];
        if add {
            args.push("--add".to_string());
        } else {
            args.push("--remove".to_string());
            args.push("--force".to_string());
        }
        args.push(format!("--allow-principal=User:{}", acl.username));
        args.push(format!("--operation={}", acl.operation));
        match acl.resource_type {
            ResourceType::Topic => args.push(format!("--topic={}", acl.resource_name)),
            ResourceType::Group => args.push(format!("--group={}", acl.resource_name)),
            ResourceType::Cluster => args.push("--cluster".to_string()),
        }
        if acl.pattern == PatternType::Prefixed {
            args.push("--resource-pattern-type=PREFIXED".to_string());
        }
        args.push(self.tls_config_arg());
        args
    }

    pub fn list_acls_args(&self, zookeeper: &str, username: &str) -> Vec<String> {
        vec![
            format!("--authorizer-properties=zookeeper.connect={}", zookeeper),
            "--list".to_string(),
            format!("--principal=User:{}", username),
            self.tls_config_arg(),
        ]
    }

    async fn run(&self, tool: &str, args: &[String]) -> CommandOutcome {
        let program = format!("{}.{}", self.config.bin_prefix, tool);
        // Arguments may carry a password; only the tool and action are logged
        debug!("Running {} {}", program, args.get(1).map(String::as_str).unwrap_or(""));

        let result = Command::new(&program)
            .args(args)
            .env("KAFKA_OPTS", self.config.opts.join(" "))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => return CommandOutcome::Failed(format!("Failed to run {}: {}", program, e)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            return CommandOutcome::Ready(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!("{} failed - status={}, stderr={}", program, output.status, stderr);
        classify_failure(&stderr)
    }
}

fn classify_failure(stderr: &str) -> CommandOutcome {
    if TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m)) {
        CommandOutcome::NotReadyYet(stderr.to_string())
    } else {
        CommandOutcome::Failed(stderr.to_string())
    }
}

#[async_trait]
impl AuthBackend for KafkaToolsBackend {
    async fn upsert_user(&self, zookeeper: &str, username: &str, password: &str) -> CommandOutcome {
        self.run("configs", &self.upsert_user_args(zookeeper, username, password))
            .await
    }

    async fn delete_user(&self, zookeeper: &str, username: &str) -> CommandOutcome {
        self.run("configs", &self.delete_user_args(zookeeper, username)).await
    }

    async fn add_acls(&self, zookeeper: &str, acls: &[AclEntry]) -> CommandOutcome {
        let mut output = String::new();
        for acl in acls {
            match self.run("acls", &self.acl_args(zookeeper, acl, true)).await {
                CommandOutcome::Ready(out) => output.push_str(&out),
                other => return other,
            }
        }
        CommandOutcome::Ready(output)
    }

    async fn remove_all_acls(&self, zookeeper: &str, username: &str) -> CommandOutcome {
        let listing = match self.run("acls", &self.list_acls_args(zookeeper, username)).await {
            CommandOutcome::Ready(out) => out,
            other => return other,
        };

        let acls = parse_acl_listing(&listing, username);
        debug!("Removing {} ACLs for {}", acls.len(), username);
        for acl in &acls {
            match self.run("acls", &self.acl_args(zookeeper, acl, false)).await {
                CommandOutcome::Ready(_) => {}
                other => {
                    warn!("Failed to remove ACL {:?}: {:?}", acl, other);
                    return other;
                }
            }
        }
        CommandOutcome::Ready(format!("removed {} ACLs", acls.len()))
    }
}

/// Parse the `--list` output of the ACL tool into entries held by `username`.
///
/// The tool prints a `ResourcePattern(resourceType=.., name=.., patternType=..)`
/// header followed by one `(principal=.., host=.., operation=.., permissionType=..)`
/// line per entry. Lines that do not parse are skipped.
pub fn parse_acl_listing(output: &str, username: &str) -> Vec<AclEntry> {
    let principal = format!("User:{}", username);
    let mut resource: Option<(ResourceType, String, PatternType)> = None;
    let mut acls = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if let Some(start) = line.find("ResourcePattern(") {
            let body = &line[start + "ResourcePattern(".len()..];
            let body = body.split(')').next().unwrap_or("");
            resource = parse_resource(body);
            continue;
        }

        if !line.starts_with("(principal=") {
            continue;
        }
        let Some((resource_type, name, pattern)) = resource.as_ref() else {
            continue;
        };
        let fields = fields(line.trim_start_matches('(').trim_end_matches(')'));
        if field(&fields, "principal") != Some(principal.as_str()) {
            continue;
        }
        if field(&fields, "permissionType") != Some("ALLOW") {
            continue;
        }
        let Some(operation) = field(&fields, "operation").and_then(parse_operation) else {
            continue;
        };

        acls.push(AclEntry {
            username: username.to_string(),
            resource_type: *resource_type,
            resource_name: name.clone(),
            pattern: *pattern,
            operation,
        });
    }

    acls
}

fn fields(body: &str) -> Vec<(&str, &str)> {
    body.split(", ")
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

fn field<'a>(fields: &[(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    fields.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

fn parse_resource(body: &str) -> Option<(ResourceType, String, PatternType)> {
    let fields = fields(body);
    let resource_type = match field(&fields, "resourceType")? {
        "TOPIC" => ResourceType::Topic,
        "GROUP" => ResourceType::Group,
        "CLUSTER" => ResourceType::Cluster,
        _ => return None,
    };
    let pattern = match field(&fields, "patternType")? {
        "LITERAL" => PatternType::Literal,
        "PREFIXED" => PatternType::Prefixed,
        _ => return None,
    };
    Some((resource_type, field(&fields, "name")?.to_string(), pattern))
}

fn parse_operation(op: &str) -> Option<AclOperation> {
    match op {
        "READ" => Some(AclOperation::Read),
        "WRITE" => Some(AclOperation::Write),
        "CREATE" => Some(AclOperation::Create),
        "DESCRIBE" => Some(AclOperation::Describe),
        "ALL" => Some(AclOperation::All),
        _ => None,
    }
}
