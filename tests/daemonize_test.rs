/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

// Harness functions (parent_pid, wait_until, send_signal, pidfile helpers) are derived from
// tests/daemon.at in Open vSwitch, with the following license:
/*
Copyright (c) 2009, 2010, 2011, 2012, 2013, 2014, 2015 Nicira, Inc.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at:

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! End-to-end tests driving the `file-scanner` demo binary as a real subprocess (§8 "End-to-end
//! scenarios"): lock-file acquisition/refusal, detach, graceful shutdown, and job draining.

use anyhow::{anyhow, Context, Result};
use std::io::ErrorKind;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::Mutex;

fn parent_pid(pid: libc::pid_t) -> Result<libc::pid_t> {
    let output = String::from_utf8(
        Command::new("ps")
            .arg("-o")
            .arg("ppid=")
            .arg("-p")
            .arg(format!("{}", pid))
            .output()?
            .stdout,
    )?;
    let pid: libc::pid_t = output
        .trim()
        .parse()
        .with_context(|| format!("parsing 'ps' output \"{output}\""))?;
    Ok(pid)
}

fn remove_if_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e)?,
    }
}

enum Completion<T> {
    Incomplete,
    Complete(T),
}
use Completion::*;

/// Repeatedly evaluates `condition`, sleeping a bit between calls, until it yields
/// Complete(value), then returns Ok(value). After a while, gives up and returns an error instead.
fn wait_until<T, F>(mut condition: F) -> Result<T>
where
    F: FnMut() -> Completion<T>,
{
    for i in 0..10 {
        if let Complete(result) = condition() {
            return Ok(result);
        }
        let ms = match i {
            0 => 10,
            1 => 100,
            _ => 1000,
        };
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
    Err(anyhow!("wait_until timed out"))
}

fn file_scanner_command() -> Result<Command> {
    let examples_dir = std::env::current_dir()?.join("target/debug/examples");
    Ok(Command::new(examples_dir.join("file-scanner")))
}

fn unique_filename(extension: &str) -> Result<PathBuf> {
    static COUNTER: Mutex<usize> = Mutex::new(0);
    let count = {
        let mut counter = COUNTER.lock().unwrap();
        *counter += 1;
        *counter
    };

    let pid = std::process::id();
    let name: PathBuf = format!("test{pid}.{count}.{extension}").into();
    remove_if_exists(&name)?;
    Ok(name)
}

fn pidfile_name() -> Result<PathBuf> {
    unique_filename("pid")
}

fn watch_dir_name() -> Result<PathBuf> {
    let dir = unique_filename("watchdir")?;
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn send_signal(pid: libc::pid_t, signal: c_int) -> Result<(), std::io::Error> {
    if unsafe { libc::kill(pid, signal) } < 0 {
        Err(std::io::Error::last_os_error())?
    } else {
        Ok(())
    }
}

fn process_exists(pid: libc::pid_t) -> Result<(), std::io::Error> {
    send_signal(pid, 0)
}

fn read_pidfile<P>(path: P) -> Result<libc::pid_t>
where
    P: AsRef<Path>,
{
    let contents = String::from_utf8(std::fs::read(path)?)?;
    Ok(contents.trim().parse()?)
}

/// Won't work if `pid` is our direct child; use `wait_for_child_to_die` in that case.
fn wait_for_process_to_die(pid: libc::pid_t) -> Result<()> {
    wait_until(|| match process_exists(pid) {
        Ok(()) => Incomplete,
        Err(_) => Complete(()),
    })
}

fn wait_until_file_exists<P>(path: P) -> Result<()>
where
    P: AsRef<Path>,
{
    wait_until(|| match path.as_ref().exists() {
        true => Complete(()),
        false => Incomplete,
    })?;
    Ok(())
}

fn check_file_does_not_exist<P>(path: P) -> Result<()>
where
    P: AsRef<Path>,
{
    match std::fs::File::open(path.as_ref()) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => Err(anyhow!("{}: expected NotFound, got {other:?}", path.as_ref().display()))?,
    }
}

/// Waits for `child` to die, and returns:
///    - `Ok(Ok(status))`: Child exited with `status`.
///    - `Ok(Err(e))`: System reported error waiting for `child`.
///    - `Err(e)`: Timeout.
fn wait_for_child_to_die(child: &mut Child) -> Result<Result<ExitStatus>> {
    match wait_until(|| match child.try_wait() {
        Ok(Some(status)) => Complete(Ok(status)),
        Ok(None) => Incomplete,
        Err(e) => Complete(Err(e)),
    }) {
        Ok(Ok(result)) => Ok(Ok(result)),
        Ok(Err(error)) => Ok(Err(error.into())),
        Err(error) => Err(error),
    }
}

#[test]
fn test_pidfile() -> Result<()> {
    let pidfile_name = pidfile_name()?;
    let watch_dir = watch_dir_name()?;
    let mut child = file_scanner_command()?
        .arg("--pid-file")
        .arg(&pidfile_name)
        .arg("--watch-dir")
        .arg(&watch_dir)
        .spawn()?;
    wait_until_file_exists(&pidfile_name)?;
    assert_eq!(read_pidfile(&pidfile_name)?, child.id() as libc::pid_t);

    send_signal(child.id() as libc::pid_t, libc::SIGTERM)?;
    child.wait()?;

    check_file_does_not_exist(&pidfile_name)?;
    std::fs::remove_dir_all(&watch_dir).ok();
    Ok(())
}

#[test]
fn test_graceful_shutdown() -> Result<()> {
    let pidfile_name = pidfile_name()?;
    let watch_dir = watch_dir_name()?;
    let mut child = file_scanner_command()?
        .arg("--pid-file")
        .arg(&pidfile_name)
        .arg("--watch-dir")
        .arg(&watch_dir)
        .spawn()?;
    let pid = child.id() as libc::pid_t;
    wait_until_file_exists(&pidfile_name)?;
    assert_eq!(read_pidfile(&pidfile_name)?, pid);

    send_signal(pid, libc::SIGTERM)?;
    let status = wait_for_child_to_die(&mut child)??;
    assert!(status.success());
    check_file_does_not_exist(&pidfile_name)?;
    std::fs::remove_dir_all(&watch_dir).ok();
    Ok(())
}

#[test]
fn test_detach() -> Result<()> {
    // The foreground process is expected to exit (status 0) once the detached child has reported
    // successful startup, well before we see the pidfile.
    let pidfile_name = pidfile_name()?;
    let watch_dir = watch_dir_name()?;
    let mut child = file_scanner_command()?
        .arg("--pid-file")
        .arg(&pidfile_name)
        .arg("--watch-dir")
        .arg(&watch_dir)
        .arg("--detach")
        .spawn()?;
    let child_pid = child.id() as libc::pid_t;
    let status = wait_for_child_to_die(&mut child)??;
    assert!(status.success());

    wait_until_file_exists(&pidfile_name)?;
    let daemon_pid = read_pidfile(&pidfile_name)?;

    process_exists(daemon_pid)?;
    assert_ne!(child_pid, daemon_pid);
    assert_ne!(child_pid, parent_pid(daemon_pid)?);

    send_signal(daemon_pid, libc::SIGTERM)?;
    wait_for_process_to_die(daemon_pid)?;
    check_file_does_not_exist(&pidfile_name)?;
    std::fs::remove_dir_all(&watch_dir).ok();
    Ok(())
}

#[test]
fn test_stale_pidfile_is_reclaimed() -> Result<()> {
    let pidfile_name = pidfile_name()?;
    let watch_dir = watch_dir_name()?;
    // pid 2^20-ish is extremely unlikely to be a live process in the test container.
    std::fs::write(&pidfile_name, "999999")?;

    let mut child = file_scanner_command()?
        .arg("--pid-file")
        .arg(&pidfile_name)
        .arg("--watch-dir")
        .arg(&watch_dir)
        .spawn()?;
    wait_until_file_exists(&pidfile_name)?;
    assert_eq!(read_pidfile(&pidfile_name)?, child.id() as libc::pid_t);

    send_signal(child.id() as libc::pid_t, libc::SIGTERM)?;
    child.wait()?;
    check_file_does_not_exist(&pidfile_name)?;
    std::fs::remove_dir_all(&watch_dir).ok();
    Ok(())
}

#[test]
fn test_second_instance_refused() -> Result<()> {
    let pidfile_name = pidfile_name()?;
    let watch_dir = watch_dir_name()?;
    let mut first = file_scanner_command()?
        .arg("--pid-file")
        .arg(&pidfile_name)
        .arg("--watch-dir")
        .arg(&watch_dir)
        .spawn()?;
    wait_until_file_exists(&pidfile_name)?;
    let first_pid = first.id() as libc::pid_t;
    assert_eq!(read_pidfile(&pidfile_name)?, first_pid);

    let mut second = file_scanner_command()?
        .arg("--pid-file")
        .arg(&pidfile_name)
        .arg("--watch-dir")
        .arg(&watch_dir)
        .spawn()?;
    let status = wait_for_child_to_die(&mut second)??;
    assert!(!status.success());

    // The first instance is unaffected.
    process_exists(first_pid)?;
    assert_eq!(read_pidfile(&pidfile_name)?, first_pid);

    send_signal(first_pid, libc::SIGTERM)?;
    first.wait()?;
    check_file_does_not_exist(&pidfile_name)?;
    std::fs::remove_dir_all(&watch_dir).ok();
    Ok(())
}

#[test]
fn test_jobs_drain_before_shutdown() -> Result<()> {
    let pidfile_name = pidfile_name()?;
    let watch_dir = watch_dir_name()?;
    for i in 0..3 {
        std::fs::write(watch_dir.join(format!("job{i}.txt")), b"line one\nline two\n")?;
    }

    let mut child = file_scanner_command()?
        .arg("--pid-file")
        .arg(&pidfile_name)
        .arg("--watch-dir")
        .arg(&watch_dir)
        .arg("--max-workers")
        .arg("2")
        .spawn()?;
    wait_until_file_exists(&pidfile_name)?;

    // Give the dispatcher a little time to pick up and finish the (near-instantaneous) jobs
    // before asking it to shut down.
    wait_until(|| match std::fs::read_dir(&watch_dir) {
        Ok(mut entries) if entries.next().is_none() => Complete(()),
        _ => Incomplete,
    })?;

    let pid = child.id() as libc::pid_t;
    send_signal(pid, libc::SIGTERM)?;
    let status = wait_for_child_to_die(&mut child)??;
    assert!(status.success());
    check_file_does_not_exist(&pidfile_name)?;
    std::fs::remove_dir_all(&watch_dir).ok();
    Ok(())
}
