use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{self, Read};
use std::time::Instant;
use tracing::{dispatcher, error, info, info_span};

use crate::config::NetConf;
use crate::error::{VethError, CODE_PLUGIN};
use crate::ip::IpRoute2;
use crate::logging;
use crate::plugin::VethPlugin;
use crate::types::{CmdArgs, K8sArgs};

/// Specification versions this plugin accepts
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Version used when the request does not name one
pub const DEFAULT_CNI_VERSION: &str = "1.0.0";

/// A failed invocation, reported to the runtime as a CNI error object.
#[derive(Debug)]
pub struct CniError {
    /// Version of the request, echoed back in the error
    pub cni_version: String,
    pub error: anyhow::Error,
}

impl CniError {
    fn new(stdin_data: &[u8], error: anyhow::Error) -> Self {
        Self {
            cni_version: request_version(stdin_data),
            error,
        }
    }

    /// Code of the first classified error in the chain.
    pub fn code(&self) -> u32 {
        self.error
            .chain()
            .find_map(|e| e.downcast_ref::<VethError>())
            .map_or(CODE_PLUGIN, VethError::code)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "cniVersion": self.cni_version,
            "code": self.code(),
            "msg": self.error.to_string(),
            "details": format!("{:#}", self.error),
        })
    }
}

/// `cniVersion` of the network configuration, if it can be read at all.
pub fn request_version(stdin_data: &[u8]) -> String {
    #[derive(Deserialize)]
    struct Versioned {
        #[serde(rename = "cniVersion", default)]
        cni_version: Option<String>,
    }

    serde_json::from_slice::<Versioned>(stdin_data)
        .ok()
        .and_then(|v| v.cni_version)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string())
}

/// Invocation parameters passed by the container runtime through the environment
#[derive(Debug, Clone, Parser)]
#[clap(name = "veth", author, version, about)]
pub struct CniEnv {
    /// Operation to perform: ADD, DEL, CHECK or VERSION
    #[clap(long, env = "CNI_COMMAND")]
    pub command: String,

    /// Container ID
    #[clap(long, env = "CNI_CONTAINERID", default_value = "")]
    pub container_id: String,

    /// Path of the container network namespace
    #[clap(long, env = "CNI_NETNS", default_value = "")]
    pub netns: String,

    /// Interface name inside the container
    #[clap(long, env = "CNI_IFNAME", default_value = "")]
    pub ifname: String,

    /// Extra `KEY=VALUE;...` arguments
    #[clap(long, env = "CNI_ARGS", default_value = "")]
    pub args: String,

    /// Plugin search path
    #[clap(long, env = "CNI_PATH", default_value = "")]
    pub path: String,
}

impl CniEnv {
    /// Combine the environment with the network configuration read from stdin.
    pub fn cmd_args(&self, stdin_data: Vec<u8>) -> Result<CmdArgs> {
        for (name, value) in [
            ("CNI_CONTAINERID", &self.container_id),
            ("CNI_NETNS", &self.netns),
            ("CNI_IFNAME", &self.ifname),
        ] {
            if value.is_empty() {
                bail!("{} not found in environment", name);
            }
        }

        Ok(CmdArgs {
            container_id: self.container_id.clone(),
            netns: self.netns.clone(),
            ifname: self.ifname.clone(),
            args: parse_cni_args(&self.args),
            path: self.path.clone(),
            stdin_data,
        })
    }
}

/// Parse CNI_ARGS string into key-value pairs
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut stdin_data = Vec::new();
    io::stdin()
        .read_to_end(&mut stdin_data)
        .context("Failed to read from stdin")?;
    Ok(stdin_data)
}

/// Execute the add command
pub fn cmd_add(env: &CniEnv, stdin_data: &[u8]) -> Result<()> {
    let args = env.cmd_args(stdin_data.to_vec())?;
    let conf = NetConf::parse(&args.stdin_data)?;

    let dispatch = logging::init(&conf.log_options()).context("failed to init logger")?;
    let k8s = K8sArgs::from_args(&args.args).context("failed to get pod information")?;

    dispatcher::with_default(&dispatch, || {
        let span = info_span!(
            "cni",
            action = "ADD",
            container_id = %args.container_id,
            pod_uid = %k8s.pod_uid,
            pod_name = %k8s.pod_name,
            pod_namespace = %k8s.pod_namespace,
            pod_infra_container_id = %k8s.pod_infra_container_id,
            if_name = %args.ifname,
        );
        let _enter = span.enter();

        let start = Instant::now();
        info!(
            version = env!("CARGO_PKG_VERSION"),
            netns = %args.netns,
            cni_path = %args.path,
            pod_ip = ?k8s.ip,
            "veth starting"
        );

        let cni_version = conf.cni_version.clone();
        let plugin = VethPlugin::new(conf, args, IpRoute2::default());
        let result = plugin.add_network().map_err(|e| {
            error!(error = %e, code = e.code(), "failed to call veth plugin");
            e
        })?;

        info!(
            elapsed_us = start.elapsed().as_micros() as u64,
            cni_version = %cni_version,
            "succeeded to call veth plugin"
        );
        result.print()
    })
}

/// Execute the delete command; nothing is torn down.
pub fn cmd_del(_env: &CniEnv, _stdin_data: &[u8]) -> Result<()> {
    Ok(())
}

/// Execute the check command
pub fn cmd_check(_env: &CniEnv, _stdin_data: &[u8]) -> Result<()> {
    bail!("CHECK is not implemented")
}

/// Report the supported specification versions.
pub fn version() -> Result<()> {
    let out = json!({
        "cniVersion": DEFAULT_CNI_VERSION,
        "supportedVersions": SUPPORTED_VERSIONS,
    });
    println!("{}", out);
    Ok(())
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> std::result::Result<(), CniError> {
    let env = CniEnv::try_parse()
        .context("CNI_COMMAND not found in environment")
        .map_err(|e| CniError::new(&[], e))?;

    // VERSION may be invoked without a configuration on stdin
    let stdin_data = if env.command == "VERSION" {
        Vec::new()
    } else {
        read_stdin().map_err(|e| CniError::new(&[], e))?
    };

    dispatch(&env, &stdin_data).map_err(|e| CniError::new(&stdin_data, e))
}

/// Execute the operation named by `CNI_COMMAND`.
pub fn dispatch(env: &CniEnv, stdin_data: &[u8]) -> Result<()> {
    match env.command.as_str() {
        "ADD" => cmd_add(env, stdin_data),
        "DEL" => cmd_del(env, stdin_data),
        "CHECK" => cmd_check(env, stdin_data),
        "VERSION" => version(),
        other => bail!("Unknown CNI command: {}", other),
    }
}
