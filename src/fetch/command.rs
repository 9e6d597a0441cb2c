use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Public trackers added to every download
pub const DEFAULT_TRACKERS: &[&str] = &[
    "udp://tracker.openbittorrent.com:80",
    "udp://tracker.opentrackr.org:1337",
    "udp://9.rarbg.me:2710",
    "udp://9.rarbg.to:2710",
    "udp://tracker.tiny-vps.com:6969",
    "udp://open.demonii.com:1337/announce",
    "udp://tracker.internetwarriors.net:1337",
    "udp://tracker.leechers-paradise.org:6969/announce",
    "udp://exodus.desync.com:6969",
    "udp://tracker.moeking.me:6969",
    "udp://tracker.dler.org:6969",
    "udp://tracker.filemail.com:6969",
    "udp://public.popcorn-tracker.org:6969",
    "udp://explodie.org:6969",
    "udp://tracker.torrent.eu.org:451",
    "udp://tracker.cyberia.is:6969",
    "udp://p4p.arenabg.com:1337",
    "udp://tracker.bt4g.com:6969/announce",
    "udp://tracker4.itzmx.com:2710/announce",
    "udp://tracker.ccc.de:80",
    "udp://denis.stalker.upeer.me:6969/announce",
];

const ARIA2_FLAGS: &[&str] = &[
    "--enable-color=false",
    "--console-log-level=notice",
    "--log-level=warn",
    "--allow-overwrite=true",
    "--check-certificate=false",
    "--auto-file-renaming=true",
    "--file-allocation=none",
    "--enable-dht=true",
    "--bt-enable-lpd=true",
    "--bt-save-metadata=true",
    "--seed-time=0",
    "--max-connection-per-server=16",
    "--split=16",
    "--max-concurrent-downloads=5",
    "--summary-interval=1",
];

/// A fully resolved command line for the fetch tool
#[derive(Debug, Clone)]
pub struct FetchCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl FetchCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Builds the process with piped output. The child dies with its handle.
    pub fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// How aria2c gets invoked
#[derive(Debug, Clone)]
pub struct Aria2Options {
    pub program: PathBuf,
    pub trackers: Vec<String>,
}

impl Default for Aria2Options {
    fn default() -> Self {
        Self {
            program: PathBuf::from("aria2c"),
            trackers: DEFAULT_TRACKERS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl Aria2Options {
    /// Command downloading `target` (a magnet locator or descriptor path) into `dir`
    pub fn command(&self, dir: &Path, target: &str) -> FetchCommand {
        let mut args: Vec<String> = ARIA2_FLAGS.iter().map(|flag| flag.to_string()).collect();
        if !self.trackers.is_empty() {
            args.push(format!("--bt-tracker={}", self.trackers.join(",")));
        }
        args.push(format!("--dir={}", dir.display()));
        args.push(target.to_string());
        FetchCommand::new(&self.program, args)
    }
}
