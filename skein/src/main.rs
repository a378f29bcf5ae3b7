//! The skein command-line entry point. Parses leading `--version`/`--help`
//! and hands everything else to the command driver.

use std::env;

fn main() {
    std::process::exit(main_inner());
}

fn main_inner() -> i32 {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None => {
            println!("{}", help());
            0
        }
        Some("--version") | Some("-V") => {
            println!("skein {}", skein::version());
            0
        }
        Some("--help") | Some("-h") => {
            println!("{}", help());
            0
        }
        Some(_) => skein::cmd::run(&args),
    }
}

fn help() -> &'static str {
    r#"skein -- hermetic, incremental builds

Usage: skein [flags] <command> [args]

Commands:
    build <targets...>   Resolve, analyze and execute the given targets
    query <expr>         Analysis-only; prints target relationships
                         (patterns, deps(...), rdeps(...), aspect(name, ...))
    clean [--expunge]    Evict caches; --expunge removes the execution root
    shutdown             Ask the background daemon to exit
    info [key]           Print configuration and path values

Flags:
    --keep-going | -k                          Continue past failures
    --jobs=N                                   Worker threads
    --disk_cache=PATH                          Action cache location
    --remote_cache=URL                         Remote cache endpoint
    --repository_disable_download              Never fetch external repos
    --experimental_sibling_repository_layout   Sibling external layout
    --define=KEY=VALUE                         Set a configuration option
    --version | -V                             Print the version
    --help | -h                                This message
"#
}
