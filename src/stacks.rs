use crate::{
    constants::API_ERROR_INVALID_STACK_NAME,
    error::GatewayError,
    models::{DockerHub, Endpoint, Registry, Stack},
};
use async_trait::async_trait;
use axum::http::StatusCode;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};
use tokio::{io::AsyncWriteExt, process::Command, sync::Mutex};
use tracing::{info, instrument, warn};

pub const COMPOSE_FILE_NAME: &str = "docker-compose.yml";

/// Deploy tool invoked for stack operations.
#[async_trait]
pub trait StackManager: Send + Sync {
    async fn login(
        &self,
        registries: &[Registry],
        dockerhub: &DockerHub,
        endpoint: &Endpoint,
    ) -> Result<(), GatewayError>;
    async fn logout(&self, endpoint: &Endpoint) -> Result<(), GatewayError>;
    async fn deploy(&self, stack: &Stack, prune: bool, endpoint: &Endpoint)
    -> Result<(), GatewayError>;
    async fn remove(&self, stack: &Stack, endpoint: &Endpoint) -> Result<(), GatewayError>;
}

/// Serializes deploy tool invocations: one creation at a time and one
/// deletion at a time across every stack and endpoint.
pub struct StackDeployer {
    manager: Arc<dyn StackManager>,
    creation_lock: Mutex<()>,
    deletion_lock: Mutex<()>,
}

impl StackDeployer {
    pub fn new(manager: Arc<dyn StackManager>) -> Self {
        Self {
            manager,
            creation_lock: Mutex::new(()),
            deletion_lock: Mutex::new(()),
        }
    }

    #[instrument(
        skip_all,
        fields(stack = %stack.name, endpoint_id = %endpoint.id, prune = prune)
    )]
    pub async fn deploy(
        &self,
        stack: &Stack,
        endpoint: &Endpoint,
        registries: &[Registry],
        dockerhub: &DockerHub,
        prune: bool,
    ) -> Result<(), GatewayError> {
        let _guard = self.creation_lock.lock().await;
        self.manager.login(registries, dockerhub, endpoint).await?;
        let result = self.manager.deploy(stack, prune, endpoint).await;
        if let Err(err) = self.manager.logout(endpoint).await {
            warn!(error = %err, "registry logout failed after deploy");
        }
        if result.is_ok() {
            info!("stack deployed");
        }
        result
    }

    #[instrument(skip_all, fields(stack = %stack.name, endpoint_id = %endpoint.id))]
    pub async fn remove(&self, stack: &Stack, endpoint: &Endpoint) -> Result<(), GatewayError> {
        let _guard = self.deletion_lock.lock().await;
        self.manager.remove(stack, endpoint).await?;
        info!("stack removed");
        Ok(())
    }
}

/// Compose project names: an ASCII letter or digit, then letters, digits,
/// `_`, `.` or `-`.
pub fn is_valid_project_name(value: &str) -> bool {
    let mut chars = value.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Directory holding the compose project of `stack_id`. Always a direct
/// child of `root`.
pub fn project_dir(root: &Path, stack_id: &str) -> Result<PathBuf, GatewayError> {
    if !is_valid_project_name(stack_id) {
        return Err(GatewayError::bad_request(API_ERROR_INVALID_STACK_NAME));
    }
    Ok(root.join(stack_id))
}

/// Writes the compose file for `stack_id` under `root` and returns the
/// project directory.
pub async fn write_compose_file(
    root: &Path,
    stack_id: &str,
    content: &str,
) -> Result<PathBuf, GatewayError> {
    let project_path = project_dir(root, stack_id)?;
    tokio::fs::create_dir_all(&project_path).await?;
    tokio::fs::write(project_path.join(COMPOSE_FILE_NAME), content).await?;
    Ok(project_path)
}

pub async fn remove_project(project_path: &Path) -> Result<(), GatewayError> {
    match tokio::fs::remove_dir_all(project_path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// `StackManager` backed by the docker CLI. Registry logins are kept in a
/// private client config directory so they never touch the host user's.
pub struct DockerCliStackManager {
    binary: String,
    config_dir: PathBuf,
}

impl DockerCliStackManager {
    pub fn new(binary: impl Into<String>, config_dir: PathBuf) -> Self {
        Self {
            binary: binary.into(),
            config_dir,
        }
    }

    fn endpoint_args(&self, endpoint: &Endpoint) -> Vec<String> {
        let mut args = vec![
            "--config".to_string(),
            self.config_dir.display().to_string(),
            "-H".to_string(),
            endpoint.url.clone(),
        ];
        let tls = &endpoint.tls_config;
        if tls.tls {
            args.push("--tls".to_string());
            if !tls.tls_skip_verify {
                args.push("--tlsverify".to_string());
                if let Some(path) = &tls.tls_ca_cert_path {
                    args.push(format!("--tlscacert={path}"));
                }
            }
            if let Some(path) = &tls.tls_cert_path {
                args.push(format!("--tlscert={path}"));
            }
            if let Some(path) = &tls.tls_key_path {
                args.push(format!("--tlskey={path}"));
            }
        }
        args
    }

    fn deploy_args(&self, stack: &Stack, prune: bool, endpoint: &Endpoint) -> Vec<String> {
        let mut args = self.endpoint_args(endpoint);
        args.extend(["stack", "deploy", "--with-registry-auth"].map(String::from));
        if prune {
            args.push("--prune".to_string());
        }
        args.push("--compose-file".to_string());
        args.push(
            Path::new(&stack.project_path)
                .join(&stack.entry_point)
                .display()
                .to_string(),
        );
        args.push(stack.name.clone());
        args
    }

    fn remove_args(&self, stack: &Stack, endpoint: &Endpoint) -> Vec<String> {
        let mut args = self.endpoint_args(endpoint);
        args.extend(["stack", "rm"].map(String::from));
        args.push(stack.name.clone());
        args
    }

    async fn run(
        &self,
        args: Vec<String>,
        env: &[(String, String)],
        stdin: Option<&str>,
    ) -> Result<(), GatewayError> {
        let mut command = Command::new(&self.binary);
        command
            .args(&args)
            .envs(env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            GatewayError::Configuration(format!("unable to run {}: {err}", self.binary))
        })?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            drop(pipe);
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(GatewayError::http(StatusCode::INTERNAL_SERVER_ERROR, stderr))
    }
}

#[async_trait]
impl StackManager for DockerCliStackManager {
    async fn login(
        &self,
        registries: &[Registry],
        dockerhub: &DockerHub,
        endpoint: &Endpoint,
    ) -> Result<(), GatewayError> {
        if dockerhub.authentication {
            let mut args = self.endpoint_args(endpoint);
            args.extend(
                [
                    "login",
                    "--username",
                    dockerhub.username.as_str(),
                    "--password-stdin",
                ]
                .map(String::from),
            );
            self.run(args, &[], Some(&dockerhub.password)).await?;
        }
        for registry in registries.iter().filter(|registry| registry.authentication) {
            let mut args = self.endpoint_args(endpoint);
            args.extend(
                [
                    "login",
                    "--username",
                    registry.username.as_str(),
                    "--password-stdin",
                    registry.url.as_str(),
                ]
                .map(String::from),
            );
            self.run(args, &[], Some(&registry.password)).await?;
        }
        Ok(())
    }

    async fn logout(&self, endpoint: &Endpoint) -> Result<(), GatewayError> {
        let mut args = self.endpoint_args(endpoint);
        args.push("logout".to_string());
        self.run(args, &[], None).await
    }

    async fn deploy(
        &self,
        stack: &Stack,
        prune: bool,
        endpoint: &Endpoint,
    ) -> Result<(), GatewayError> {
        let env = stack
            .env
            .iter()
            .map(|pair| (pair.name.clone(), pair.value.clone()))
            .collect::<Vec<_>>();
        self.run(self.deploy_args(stack, prune, endpoint), &env, None)
            .await
    }

    async fn remove(&self, stack: &Stack, endpoint: &Endpoint) -> Result<(), GatewayError> {
        self.run(self.remove_args(stack, endpoint), &[], None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AzureCredentials, EndpointGroupId, EndpointId, EndpointType, Pair, TlsConfiguration,
    };
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tempfile::TempDir;

    fn endpoint(tls: TlsConfiguration) -> Endpoint {
        Endpoint {
            id: EndpointId(1),
            name: "local".to_string(),
            endpoint_type: EndpointType::Docker,
            url: "tcp://10.0.0.1:2376".to_string(),
            public_url: String::new(),
            group_id: EndpointGroupId(1),
            tls_config: tls,
            azure_credentials: AzureCredentials::default(),
            authorized_users: Vec::new(),
            authorized_teams: Vec::new(),
            extensions: Vec::new(),
        }
    }

    fn stack(name: &str) -> Stack {
        Stack {
            id: Stack::identifier(name, "swarm"),
            name: name.to_string(),
            swarm_id: "swarm".to_string(),
            entry_point: COMPOSE_FILE_NAME.to_string(),
            project_path: "/data/compose/web_swarm".to_string(),
            env: vec![Pair {
                name: "TAG".to_string(),
                value: "1.0".to_string(),
            }],
        }
    }

    #[derive(Default)]
    struct CountingManager {
        active: AtomicUsize,
        max_active: AtomicUsize,
        logouts: AtomicUsize,
        fail_deploy: bool,
    }

    impl CountingManager {
        async fn occupy(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl StackManager for CountingManager {
        async fn login(&self, _: &[Registry], _: &DockerHub, _: &Endpoint) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn logout(&self, _: &Endpoint) -> Result<(), GatewayError> {
            self.logouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn deploy(&self, _: &Stack, _: bool, _: &Endpoint) -> Result<(), GatewayError> {
            self.occupy().await;
            if self.fail_deploy {
                return Err(GatewayError::http(StatusCode::INTERNAL_SERVER_ERROR, "boom"));
            }
            Ok(())
        }

        async fn remove(&self, _: &Stack, _: &Endpoint) -> Result<(), GatewayError> {
            self.occupy().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn deploys_never_overlap() {
        let manager = Arc::new(CountingManager::default());
        let deployer = Arc::new(StackDeployer::new(manager.clone()));
        let endpoint = endpoint(TlsConfiguration::default());
        let mut tasks = Vec::new();
        for index in 0..8 {
            let deployer = deployer.clone();
            let endpoint = endpoint.clone();
            tasks.push(tokio::spawn(async move {
                deployer
                    .deploy(
                        &stack(&format!("s{index}")),
                        &endpoint,
                        &[],
                        &DockerHub::default(),
                        false,
                    )
                    .await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("deploy");
        }
        assert_eq!(manager.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(manager.logouts.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn removals_never_overlap() {
        let manager = Arc::new(CountingManager::default());
        let deployer = Arc::new(StackDeployer::new(manager.clone()));
        let endpoint = endpoint(TlsConfiguration::default());
        let mut tasks = Vec::new();
        for index in 0..4 {
            let deployer = deployer.clone();
            let endpoint = endpoint.clone();
            tasks.push(tokio::spawn(async move {
                deployer.remove(&stack(&format!("s{index}")), &endpoint).await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("remove");
        }
        assert_eq!(manager.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_deploy_still_logs_out() {
        let manager = Arc::new(CountingManager {
            fail_deploy: true,
            ..CountingManager::default()
        });
        let deployer = StackDeployer::new(manager.clone());
        let err = deployer
            .deploy(
                &stack("web"),
                &endpoint(TlsConfiguration::default()),
                &[],
                &DockerHub::default(),
                false,
            )
            .await
            .expect_err("deploy fails");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(manager.logouts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn docker_cli_arguments_carry_tls_material() {
        let manager = DockerCliStackManager::new("docker", PathBuf::from("/data/docker"));
        let endpoint = endpoint(TlsConfiguration {
            tls: true,
            tls_skip_verify: false,
            tls_ca_cert_path: Some("/certs/ca.pem".to_string()),
            tls_cert_path: Some("/certs/cert.pem".to_string()),
            tls_key_path: Some("/certs/key.pem".to_string()),
        });
        let args = manager.deploy_args(&stack("web"), true, &endpoint);
        assert_eq!(
            args,
            vec![
                "--config",
                "/data/docker",
                "-H",
                "tcp://10.0.0.1:2376",
                "--tls",
                "--tlsverify",
                "--tlscacert=/certs/ca.pem",
                "--tlscert=/certs/cert.pem",
                "--tlskey=/certs/key.pem",
                "stack",
                "deploy",
                "--with-registry-auth",
                "--prune",
                "--compose-file",
                "/data/compose/web_swarm/docker-compose.yml",
                "web",
            ]
        );
    }

    #[test]
    fn skip_verify_omits_ca() {
        let manager = DockerCliStackManager::new("docker", PathBuf::from("/d"));
        let endpoint = endpoint(TlsConfiguration {
            tls: true,
            tls_skip_verify: true,
            tls_ca_cert_path: Some("/certs/ca.pem".to_string()),
            tls_cert_path: None,
            tls_key_path: None,
        });
        let args = manager.remove_args(&stack("web"), &endpoint);
        assert!(args.contains(&"--tls".to_string()));
        assert!(!args.iter().any(|arg| arg.starts_with("--tlscacert")));
        assert_eq!(&args[args.len() - 3..], ["stack", "rm", "web"]);
    }

    #[tokio::test]
    async fn compose_files_are_written_per_stack() {
        let dir = TempDir::new().expect("tempdir");
        let project = write_compose_file(dir.path(), "web_swarm", "version: '3'\n")
            .await
            .expect("write");
        let content = tokio::fs::read_to_string(project.join(COMPOSE_FILE_NAME))
            .await
            .expect("read");
        assert_eq!(content, "version: '3'\n");
        remove_project(&project).await.expect("remove");
        remove_project(&project).await.expect("idempotent remove");
        assert!(!project.exists());
    }

    #[tokio::test]
    async fn compose_files_never_leave_the_root() {
        let dir = TempDir::new().expect("tempdir");
        let outside = TempDir::new().expect("outside");
        let absolute = outside.path().join("victim_x").display().to_string();
        for stack_id in ["../escape_x", absolute.as_str(), ".hidden_x", "a/b_x", ""] {
            let err = write_compose_file(dir.path(), stack_id, "version: '3'\n")
                .await
                .expect_err("rejected");
            assert_eq!(err.status(), StatusCode::BAD_REQUEST, "{stack_id}");
        }
        assert!(!outside.path().join("victim_x").exists());
        assert!(project_dir(dir.path(), "web_swarm-1.2").is_ok());
    }

    #[tokio::test]
    async fn prune_reaches_the_deploy_tool() {
        #[derive(Default)]
        struct PruneRecorder(std::sync::Mutex<Vec<bool>>);

        #[async_trait]
        impl StackManager for PruneRecorder {
            async fn login(&self, _: &[Registry], _: &DockerHub, _: &Endpoint) -> Result<(), GatewayError> {
                Ok(())
            }
            async fn logout(&self, _: &Endpoint) -> Result<(), GatewayError> {
                Ok(())
            }
            async fn deploy(&self, _: &Stack, prune: bool, _: &Endpoint) -> Result<(), GatewayError> {
                self.0.lock().expect("prunes").push(prune);
                Ok(())
            }
            async fn remove(&self, _: &Stack, _: &Endpoint) -> Result<(), GatewayError> {
                Ok(())
            }
        }

        let recorder = Arc::new(PruneRecorder::default());
        let deployer = StackDeployer::new(recorder.clone());
        let endpoint = endpoint(TlsConfiguration::default());
        for prune in [false, true] {
            deployer
                .deploy(&stack("web"), &endpoint, &[], &DockerHub::default(), prune)
                .await
                .expect("deploy");
        }
        assert_eq!(*recorder.0.lock().expect("prunes"), vec![false, true]);
    }
}
