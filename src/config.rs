//! Static configuration: the builder table, the watched repositories, and
//! process-level settings.
//!
//! Both tables are populated once at startup and read-only afterwards.
//! Mistakes in the declarative tables (duplicate names, a builder with no
//! image) are programmer errors and panic immediately.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Dashboard that builders report to unless configured otherwise.
pub const DEFAULT_DASHBOARD: &str = "https://build.golang.org";

/// Image namespace shared by all builder images. Used both for defaulting
/// images in the table and for counting build containers in the runtime.
pub const BUILDER_IMAGE_PREFIX: &str = "gobuilders/";

const BASE_IMAGE: &str = "gobuilders/linux-x86-base";
const NACL_IMAGE: &str = "gobuilders/linux-x86-nacl";
const GCCGO_IMAGE: &str = "gobuilders/linux-x86-gccgo";
const SID_IMAGE: &str = "gobuilders/linux-x86-sid";
const CLANG_IMAGE: &str = "gobuilders/linux-x86-clang";

const NACL_BUILD_CMD: &str = "/usr/local/bin/build-command.pl";
const GCCGO_DASHBOARD: &str = "https://build.golang.org/gccgo";

/// Recipe for one platform/configuration tuple.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Canonical name, e.g. "linux-amd64-race". Unique across the table.
    pub name: String,
    /// Image the build container runs.
    pub image: String,
    /// Optional override of the build command inside the container.
    pub cmd: Option<String>,
    /// Extra KEY=VALUE environment pairs passed to the container.
    pub env: Vec<String>,
    /// Dashboard this builder polls and reports to.
    pub dash_url: String,
    /// Toolchain variant built by this configuration.
    pub tool: String,
}

impl BuilderConfig {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            image: String::new(),
            cmd: None,
            env: Vec::new(),
            dash_url: String::new(),
            tool: String::new(),
        }
    }

    fn image(mut self, image: &str) -> Self {
        self.image = image.to_string();
        self
    }

    fn cmd(mut self, cmd: &str) -> Self {
        self.cmd = Some(cmd.to_string());
        self
    }

    fn env(mut self, pair: &str) -> Self {
        self.env.push(pair.to_string());
        self
    }

    fn dash_url(mut self, url: &str) -> Self {
        self.dash_url = url.to_string();
        self
    }

    fn tool(mut self, tool: &str) -> Self {
        self.tool = tool.to_string();
        self
    }
}

/// A repository whose commits are watched for new revisions to build.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Source repository URL.
    pub repo: String,
    /// Dashboard the watcher reports commits to. Ends in a slash.
    pub dash: String,
    /// How often the watcher polls the repository.
    pub interval: Duration,
}

/// Process-level settings, assembled from the command line in `main`.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Admission cap on concurrently running builds.
    pub max_builds: usize,
    /// Zones periodically swept for expired build VMs.
    pub zones: Vec<String>,
    /// Local master key file. When unset the key comes from the GCE project
    /// attribute instead.
    pub master_key_file: Option<PathBuf>,
    /// Address of the status HTTP server.
    pub listen_addr: SocketAddr,
    /// How often each builder's dashboard is asked for pending work.
    pub poll_interval: Duration,
    /// Directory where per-builder key files are materialized for mounting.
    pub key_dir: PathBuf,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_builds: 6,
            zones: vec![
                "us-central1-a".to_string(),
                "us-central1-b".to_string(),
                "us-central1-f".to_string(),
            ],
            master_key_file: None,
            listen_addr: "0.0.0.0:80".parse().expect("static listen address"),
            poll_interval: Duration::from_secs(60),
            key_dir: PathBuf::from("/tmp"),
        }
    }
}

/// Builds the full builder table. With `add_temp` every name gets a "-temp"
/// suffix so a debug coordinator never races the production one for work.
pub fn builder_table(add_temp: bool) -> HashMap<String, BuilderConfig> {
    let mut builders = HashMap::new();
    let gccgo_amd64_cmd = "make RUNTESTFLAGS=\"--target_board=unix/-m64\" check-go -j16";
    let gccgo_386_cmd = "make RUNTESTFLAGS=\"--target_board=unix/-m32\" check-go -j16";
    for conf in [
        BuilderConfig::named("linux-386"),
        BuilderConfig::named("linux-386-387").env("GO386=387"),
        BuilderConfig::named("linux-amd64"),
        BuilderConfig::named("linux-amd64-nocgo")
            .env("CGO_ENABLED=0")
            .env("USER=root"),
        BuilderConfig::named("linux-amd64-noopt").env("GO_GCFLAGS=-N -l"),
        BuilderConfig::named("linux-amd64-race"),
        BuilderConfig::named("nacl-386"),
        BuilderConfig::named("nacl-amd64p32"),
        BuilderConfig::named("linux-amd64-gccgo")
            .image(GCCGO_IMAGE)
            .cmd(gccgo_amd64_cmd)
            .dash_url(GCCGO_DASHBOARD)
            .tool("gccgo"),
        BuilderConfig::named("linux-386-gccgo")
            .image(GCCGO_IMAGE)
            .cmd(gccgo_386_cmd)
            .dash_url(GCCGO_DASHBOARD)
            .tool("gccgo"),
        BuilderConfig::named("linux-386-sid").image(SID_IMAGE),
        BuilderConfig::named("linux-amd64-sid").image(SID_IMAGE),
        BuilderConfig::named("linux-386-clang").image(CLANG_IMAGE),
        BuilderConfig::named("linux-amd64-clang").image(CLANG_IMAGE),
    ] {
        add_builder(&mut builders, conf, add_temp);
    }
    builders
}

fn add_builder(builders: &mut HashMap<String, BuilderConfig>, mut c: BuilderConfig, add_temp: bool) {
    assert!(!c.name.is_empty(), "builder with empty name");
    if add_temp {
        c.name.push_str("-temp");
    }
    if c.dash_url.is_empty() {
        c.dash_url = DEFAULT_DASHBOARD.to_string();
    }
    if c.tool.is_empty() {
        c.tool = "go".to_string();
    }
    if c.name.starts_with("nacl-") {
        if c.image.is_empty() {
            c.image = NACL_IMAGE.to_string();
        }
        if c.cmd.is_none() {
            c.cmd = Some(NACL_BUILD_CMD.to_string());
        }
    }
    if c.name.starts_with("linux-") && c.image.is_empty() {
        c.image = BASE_IMAGE.to_string();
    }
    assert!(!c.image.is_empty(), "builder {} has no image", c.name);
    let name = c.name.clone();
    assert!(
        builders.insert(name.clone(), c).is_none(),
        "duplicate builder name {name}"
    );
}

/// The repositories watched for new commits.
pub fn watcher_table() -> Vec<WatchConfig> {
    vec![WatchConfig {
        repo: "https://go.googlesource.com/go".to_string(),
        dash: "https://build.golang.org/".to_string(),
        interval: Duration::from_secs(10),
    }]
}
