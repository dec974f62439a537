use std::env;
use std::fs;
use std::time::UNIX_EPOCH;

use sysinfo::{Disks, System};

use super::{ProblemReport, EXECUTABLE_TIMESTAMP, PROC_MAPS};
use crate::AppResult;

const ENVIRON_ALLOW: &[&str] = &["LANG", "LANGUAGE", "PATH", "SHELL", "TERM"];

impl ProblemReport {
    /// Attach process, OS and hardware details of the running installer.
    pub fn add_standard_info(&mut self) -> AppResult<()> {
        self.add_proc_info()?;
        self.add_os_info()?;
        self.add_hardware_info()?;
        Ok(())
    }

    fn add_proc_info(&mut self) -> AppResult<()> {
        let exe = env::current_exe()?;
        self.insert("ExecutablePath", exe.display().to_string())?;
        if let Some(modified) = fs::metadata(&exe)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        {
            self.insert(EXECUTABLE_TIMESTAMP, modified.as_secs().to_string())?;
        }

        let cmdline: Vec<String> = env::args().collect();
        self.insert("ProcCmdline", cmdline.join(" "))?;
        if let Ok(cwd) = env::current_dir() {
            self.insert("ProcCwd", cwd.display().to_string())?;
        }
        self.insert("ProcEnviron", filtered_environ())?;

        if let Ok(status) = fs::read_to_string("/proc/self/status") {
            self.insert("ProcStatus", status.trim_end())?;
        }
        if let Ok(maps) = fs::read_to_string("/proc/self/maps") {
            self.insert(PROC_MAPS, maps.trim_end())?;
        }
        Ok(())
    }

    fn add_os_info(&mut self) -> AppResult<()> {
        let name = System::name().unwrap_or_else(|| "unknown".into());
        let version = System::os_version().unwrap_or_default();
        self.insert("DistroRelease", format!("{name} {version}").trim_end())?;
        let kernel = System::kernel_version().unwrap_or_else(|| "unknown".into());
        self.insert("Uname", format!("{} {kernel} {}", env::consts::OS, env::consts::ARCH))?;
        self.insert("Architecture", package_architecture(env::consts::ARCH))?;
        Ok(())
    }

    fn add_hardware_info(&mut self) -> AppResult<()> {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();

        let brand = system
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
            .unwrap_or_else(|| "unknown".into());
        self.insert("CpuInfo", format!("{brand} ({} logical cpus)", system.cpus().len()))?;
        self.insert("MemTotal", format!("{} kB", system.total_memory() / 1024))?;

        let disks = Disks::new_with_refreshed_list();
        let lines: Vec<String> = disks
            .list()
            .iter()
            .map(|disk| {
                format!(
                    "{} {} {} {}",
                    disk.name().to_string_lossy(),
                    disk.mount_point().display(),
                    disk.file_system().to_string_lossy(),
                    disk.total_space()
                )
            })
            .collect();
        if !lines.is_empty() {
            self.insert("Disks", lines.join("\n"))?;
        }
        Ok(())
    }
}

fn filtered_environ() -> String {
    let mut vars: Vec<String> = env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .filter(|(key, _)| ENVIRON_ALLOW.contains(&key.as_str()) || key.starts_with("LC_"))
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    vars.sort();
    vars.join("\n")
}

/// Debian-style architecture names.
fn package_architecture(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "x86" => "i386",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "powerpc64" => "ppc64el",
        other => other,
    }
}
