//! Argument vectors for every OS command the agent issues, and the home directory layout they
//! operate on.

use crate::exec::{CommandLine, shell};
use std::path::{Path, PathBuf};

/// `getent` exit status for "key not found in database".
pub const GETENT_NOT_FOUND: i32 = 2;

/// Paths of one account's home under the home root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeLayout {
    home: PathBuf,
}

impl HomeLayout {
    pub fn new(home_root: &Path, username: &str) -> Self {
        Self {
            home: home_root.join(username),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn ssh_dir(&self) -> PathBuf {
        self.home.join(".ssh")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    pub fn private_key(&self) -> PathBuf {
        self.ssh_dir().join("id_rsa")
    }

    pub fn public_key(&self) -> PathBuf {
        self.ssh_dir().join("id_rsa.pub")
    }

    pub fn authorized_keys(&self) -> PathBuf {
        self.ssh_dir().join("authorized_keys")
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub fn mkdir_p(paths: &[PathBuf]) -> CommandLine {
    CommandLine::new("mkdir").arg("-p").args(paths.iter().map(|p| path_arg(p)))
}

/// New account with a user-private group allocated by the system.
pub fn useradd(username: &str, home: &Path, shell: &str) -> CommandLine {
    CommandLine::new("useradd")
        .args(["-d", path_arg(home).as_str(), "-s", shell])
        .arg(username)
}

/// Account with a fixed uid and primary gid, bound to an existing home.
pub fn useradd_with_ids(username: &str, home: &Path, shell: &str, uid: &str, gid: &str) -> CommandLine {
    CommandLine::new("useradd")
        .args(["-d", path_arg(home).as_str(), "-s", shell, "-u", uid, "-g", gid])
        .arg(username)
}

pub fn groupadd_with_gid(name: &str, gid: &str) -> CommandLine {
    CommandLine::new("groupadd").args(["-g", gid, name])
}

pub fn chown_recursive(username: &str, path: &Path) -> CommandLine {
    CommandLine::new("chown")
        .arg("-R")
        .arg(format!("{username}:{username}"))
        .arg(path_arg(path))
}

/// Strip all group and other permissions.
pub fn restrict_to_owner(path: &Path) -> CommandLine {
    CommandLine::new("chmod").arg("g-rwx,o-rwx").arg(path_arg(path))
}

/// Generate an RSA keypair with an empty passphrase as `username`.
///
/// This is the one command that passes through a shell: `su -c` takes a script, so every word
/// of the `ssh-keygen` invocation is quoted with [`shell::quote`].
pub fn ssh_keygen_as(username: &str, private_key: &Path) -> CommandLine {
    let key = path_arg(private_key);
    let script = shell::join(["ssh-keygen", "-q", "-t", "rsa", "-N", "", "-f", key.as_str()]);
    CommandLine::new("su").args(["-", username, "-c"]).arg(script)
}

pub fn rename(from: &Path, to: &Path) -> CommandLine {
    CommandLine::new("mv").args([path_arg(from), path_arg(to)])
}

pub fn id_uid(username: &str) -> CommandLine {
    CommandLine::new("id").args(["-u", username])
}

pub fn id_gid(username: &str) -> CommandLine {
    CommandLine::new("id").args(["-g", username])
}

/// Exits 0 when the account exists and [`GETENT_NOT_FOUND`] when it does not.
pub fn getent_passwd(username: &str) -> CommandLine {
    CommandLine::new("getent").args(["passwd", username])
}

/// Exits 0 when the group exists and [`GETENT_NOT_FOUND`] when it does not.
pub fn getent_group(name: &str) -> CommandLine {
    CommandLine::new("getent").args(["group", name])
}

pub fn remove_tree(path: &Path) -> CommandLine {
    CommandLine::new("rm").arg("-rf").arg(path_arg(path))
}

pub fn userdel(username: &str) -> CommandLine {
    CommandLine::new("userdel").arg(username)
}

/// POSIX output format, sizes in KiB.
pub fn disk_free(volume: &Path) -> CommandLine {
    CommandLine::new("df").args(["-P", "-k"]).arg(path_arg(volume))
}

/// Available bytes from `df -P -k` output: fourth column of the last line, in KiB.
pub fn parse_disk_free(output: &str) -> Option<u64> {
    let line = output.lines().rev().find(|l| !l.trim().is_empty())?;
    let available_kb: u64 = line.split_whitespace().nth(3)?.parse().ok()?;
    available_kb.checked_mul(1024)
}
