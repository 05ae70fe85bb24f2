//! Example relay between two processes
//!
//! The parent writes payloads of growing size and forwards each
//! `WriteResult` to a child process over its stdin. The child reads the
//! payload out of shared memory and echoes it on stdout, which doubles as
//! the acknowledgment the parent waits for before writing again.
//!
//! Run with `cargo run --example relay`.

use semshm::{KeyAllocator, SemaphoredReader, SemaphoredWriter, WriteResult};
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(io::stderr)
        .init();

    let result = match std::env::args().nth(1).as_deref() {
        Some("child") => child(),
        _ => parent(),
    };
    if let Err(e) = result {
        eprintln!("[Relay] {}", e);
        std::process::exit(1);
    }
}

fn parent() -> Result<(), Box<dyn std::error::Error>> {
    let exe = std::env::current_exe()?;
    let mut child = Command::new(exe)
        .arg("child")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    let mut to_child = child.stdin.take().ok_or("child stdin unavailable")?;
    let mut from_child = BufReader::new(child.stdout.take().ok_or("child stdout unavailable")?);

    let writer = SemaphoredWriter::new(Arc::new(KeyAllocator::per_process()));
    let payloads = ["ping", "hello", "hello again", "bye"];

    for payload in payloads {
        let handle = writer.write_bytes(payload.as_bytes())?;
        println!("[Parent] wrote {:?} -> {}", payload, handle);
        writeln!(to_child, "{}", handle)?;

        let mut echo = String::new();
        from_child.read_line(&mut echo)?;
        let echo = echo.trim_end();
        println!("[Parent] child read {:?}", echo);
        if echo != payload {
            return Err(format!("expected {:?}, got {:?}", payload, echo).into());
        }
    }

    drop(to_child);
    child.wait()?;
    writer.close()?;
    println!("[Parent] done");
    Ok(())
}

fn child() -> Result<(), Box<dyn std::error::Error>> {
    let reader = SemaphoredReader::new();
    let mut stdout = io::stdout().lock();

    for line in io::stdin().lock().lines() {
        let handle: WriteResult = line?.parse()?;
        let bytes = reader.read_bytes(&handle)?;
        writeln!(stdout, "{}", String::from_utf8_lossy(&bytes))?;
        stdout.flush()?;
    }

    reader.close()?;
    Ok(())
}
