//! emx-clitest CLI
//!
//! Run one command through a check chain from the command line.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;
use emx_clitest::{compile_regex, display_command, runner, ChainRunner, ProcessOptions, Rule, WaitFor};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "emx-clitest")]
#[command(author = "nzinfo <li.monan@gmail.com>")]
#[command(version)]
#[command(about = "Run a command and check its output, files and exit code")]
struct Cli {
    /// Working directory for the command
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Environment variables to set (KEY=VALUE)
    #[arg(short = 'e', long = "env")]
    env_vars: Vec<String>,

    /// Host the first argument as a module in the runtime ($EMX_CLITEST_RUNTIME)
    #[arg(long)]
    fork: bool,

    /// Runtime flag for --fork (repeatable)
    #[arg(long = "runtime-arg", allow_hyphen_values = true)]
    runtime_args: Vec<String>,

    /// Wait until stdout matches this regex before writing
    #[arg(long = "wait-stdout")]
    wait_stdout: Option<String>,

    /// Line to write to stdin (repeatable, in order)
    #[arg(long = "write")]
    writes: Vec<String>,

    /// Send SIGTERM after the writes
    #[arg(long)]
    kill: bool,

    /// Stdout must match (`/re/`, JSON, or substring)
    #[arg(long)]
    stdout: Vec<String>,

    /// Stdout must not match
    #[arg(long = "not-stdout")]
    not_stdout: Vec<String>,

    /// Stderr must match
    #[arg(long)]
    stderr: Vec<String>,

    /// Stderr must not match
    #[arg(long = "not-stderr")]
    not_stderr: Vec<String>,

    /// Expected exit code
    #[arg(long, allow_hyphen_values = true)]
    code: Option<i32>,

    /// File that must exist afterwards
    #[arg(long)]
    file: Vec<PathBuf>,

    /// File that must not exist afterwards
    #[arg(long = "not-file")]
    not_file: Vec<PathBuf>,

    /// Echo process output while running
    #[arg(long)]
    debug: bool,

    /// Verbose output: show chain execution log
    #[arg(short, long)]
    verbose: bool,

    /// Command to run
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let label = display_command(&cli.command[0], &cli.command[1..]);
    let verbose = cli.verbose;

    let chain = match build_chain(cli) {
        Ok(chain) => chain,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(chain.run()) {
        Ok(ctx) => {
            println!("PASS  {}", label);
            if verbose && !ctx.log.is_empty() {
                for line in ctx.log.lines() {
                    println!("      {}", line);
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("FAIL  {}", label);
            for line in format!("{:#}", e).lines() {
                println!("      {}", line);
            }
            ExitCode::FAILURE
        }
    }
}

fn parse_rule(text: &str) -> anyhow::Result<Rule> {
    let rule = Rule::parse(text).with_context(|| format!("invalid rule `{}`", text))?;
    if rule.is_empty() {
        bail!("empty rule");
    }
    Ok(rule)
}

fn build_chain(cli: Cli) -> anyhow::Result<ChainRunner> {
    if !cli.fork && !cli.runtime_args.is_empty() {
        bail!("--runtime-arg requires --fork");
    }

    let mut chain = runner();
    if let Some(dir) = cli.cwd {
        chain = chain.cwd(dir);
    }
    for var in &cli.env_vars {
        let Some((key, value)) = var.split_once('=') else {
            bail!("invalid --env `{}`: expected KEY=VALUE", var);
        };
        chain = chain.env(key, value);
    }
    if cli.debug {
        chain = chain.debug();
    }

    let program = cli.command[0].clone();
    if program.trim().is_empty() {
        bail!("empty command");
    }
    let args = cli.command[1..].to_vec();
    chain = if cli.fork {
        let mut options = ProcessOptions::new();
        if !cli.runtime_args.is_empty() {
            options = options.exec_argv(cli.runtime_args);
        }
        chain.fork_with(program, args, options)
    } else if args.is_empty() {
        if emx_clitest::split_command(&program).context("invalid command")?.is_empty() {
            bail!("empty command");
        }
        chain.spawn(program)
    } else {
        chain.spawn_with(program, args, ProcessOptions::new())
    };

    if let Some(pattern) = cli.wait_stdout {
        let re = compile_regex(&pattern)?;
        chain = chain.wait(WaitFor::Stdout(re));
    }
    for line in cli.writes {
        chain = chain.write(line);
    }
    if cli.kill {
        chain = chain.kill();
    }
    chain = chain.wait_close();

    for text in &cli.stdout {
        chain = chain.stdout(parse_rule(text)?);
    }
    for text in &cli.not_stdout {
        chain = chain.not_stdout(parse_rule(text)?);
    }
    for text in &cli.stderr {
        chain = chain.stderr(parse_rule(text)?);
    }
    for text in &cli.not_stderr {
        chain = chain.not_stderr(parse_rule(text)?);
    }
    for path in &cli.file {
        chain = chain.file(path);
    }
    for path in &cli.not_file {
        chain = chain.not_file(path);
    }

    if let Some(code) = cli.code {
        chain = chain.code(code);
    }
    Ok(chain)
}
