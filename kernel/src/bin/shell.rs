//! Interactive filesystem shell over the kernel's keyboard input path.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;

use minios_kernel::drivers::term;
use minios_kernel::{fs, Config, DiskConfig};

#[derive(Parser)]
#[command(about = "Interactive shell over a minifile disk image")]
struct Args {
    /// Disk image to mount (format it first with mkfs).
    image: PathBuf,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    minios_kernel::init(Config {
        disk: Some(DiskConfig {
            path: args.image,
            create_blocks: None,
            failure_rate: 0.0,
            crash_rate: 0.0,
        }),
        term: true,
        ..Config::default()
    });
    let code = minios_kernel::run(shell_main);
    exit(code);
}

fn shell_main() -> i32 {
    if let Err(e) = fs::mount() {
        eprintln!("shell: mount failed: {e}");
        return -1;
    }
    println!("minifile shell; 'help' lists commands.");
    loop {
        prompt();
        let line = term::read_line();
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else {
            continue;
        };
        let arg1 = words.next();
        let arg2 = words.next();
        let result = match cmd {
            "exit" => return 0,
            "help" => {
                println!(
                    "cd ls pwd mkdir rmdir rm cp mv touch type input import export \
                     whoami help exit"
                );
                Ok(())
            }
            "whoami" => {
                println!("thread {}", minios_kernel::task::current_id());
                Ok(())
            }
            "pwd" => fs::pwd().map(|p| println!("{p}")),
            "ls" => fs::ls(arg1).map(|names| {
                for n in names {
                    println!("{n}");
                }
            }),
            "cd" => require(arg1).and_then(fs::cd),
            "mkdir" => require(arg1).and_then(fs::mkdir),
            "rmdir" => require(arg1).and_then(fs::rmdir),
            "rm" => require(arg1).and_then(fs::unlink),
            "touch" => require(arg1).and_then(|p| fs::creat(p).map(fs::close)),
            "cp" => require2(arg1, arg2).and_then(|(from, to)| copy_file(from, to)),
            "mv" => require2(arg1, arg2).and_then(|(from, to)| {
                copy_file(from, to)?;
                fs::unlink(from)
            }),
            "type" => require(arg1).and_then(type_file),
            "input" => require(arg1).and_then(input_file),
            "import" => require2(arg1, arg2).and_then(|(h, g)| import_file(h, g)),
            "export" => require2(arg1, arg2).and_then(|(g, h)| export_file(g, h)),
            other => {
                println!("{other}: unknown command");
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("{cmd}: {e}");
        }
    }
}

fn prompt() {
    let cwd = fs::pwd().unwrap_or_else(|_| "?".into());
    print!("{cwd} $ ");
    let _ = std::io::stdout().flush();
}

fn require(arg: Option<&str>) -> Result<&str, fs::FsError> {
    arg.ok_or(fs::FsError::InvalidPath)
}

fn require2<'a>(
    a: Option<&'a str>,
    b: Option<&'a str>,
) -> Result<(&'a str, &'a str), fs::FsError> {
    Ok((require(a)?, require(b)?))
}

/// Copy one file to another inside the filesystem.
fn copy_file(from: &str, to: &str) -> Result<(), fs::FsError> {
    let mut src = fs::open(from, "r")?;
    let mut dst = fs::creat(to)?;
    let mut buf = vec![0u8; 4096];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        dst.write(&buf[..n])?;
    }
    fs::close(src);
    fs::close(dst);
    Ok(())
}

/// Print a file's contents.
fn type_file(path: &str) -> Result<(), fs::FsError> {
    let mut f = fs::open(path, "r")?;
    let mut buf = vec![0u8; 4096];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        print!("{}", String::from_utf8_lossy(&buf[..n]));
    }
    fs::close(f);
    Ok(())
}

/// Read keyboard lines into a file until a lone ".".
fn input_file(path: &str) -> Result<(), fs::FsError> {
    let mut f = fs::creat(path)?;
    loop {
        let line = term::read_line();
        if line == "." {
            break;
        }
        f.write(line.as_bytes())?;
        f.write(b"\n")?;
    }
    fs::close(f);
    Ok(())
}

/// Copy a host file into the filesystem.
fn import_file(host: &str, guest: &str) -> Result<(), fs::FsError> {
    let data = std::fs::read(host).map_err(|_| fs::FsError::NotFound)?;
    let mut f = fs::creat(guest)?;
    f.write(&data)?;
    fs::close(f);
    Ok(())
}

/// Copy a filesystem file out to the host.
fn export_file(guest: &str, host: &str) -> Result<(), fs::FsError> {
    let mut f = fs::open(guest, "r")?;
    let mut data = vec![0u8; f.size() as usize];
    let n = f.read(&mut data)?;
    fs::close(f);
    std::fs::write(host, &data[..n]).map_err(|_| fs::FsError::InvalidPath)?;
    Ok(())
}
