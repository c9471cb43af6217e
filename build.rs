// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn name_arg() -> Arg {
    Arg::new("name").required(true).help("Package name")
}

fn version_arg() -> Arg {
    Arg::new("version")
        .short('v')
        .long("version")
        .value_name("VERSION")
        .help("Version (default: latest)")
}

fn build_cli() -> Command {
    Command::new("cmam")
        .version(env!("CARGO_PKG_VERSION"))
        .author("CMAM Contributors")
        .about("Local application manager with verified downloads, atomic installs and rollback")
        .subcommand_required(false)
        .arg(
            Arg::new("root")
                .long("root")
                .value_name("DIR")
                .global(true)
                .help("cmam root directory (default: ~/.cmam, env: CMAM_ROOT)"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Show debug output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Only show warnings and errors"),
        )
        .subcommand(
            Command::new("install")
                .about("Install a package")
                .arg(name_arg())
                .arg(version_arg())
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Reinstall even if the same build is already installed"),
                ),
        )
        .subcommand(
            Command::new("update")
                .about("Update an installed package")
                .arg(name_arg())
                .arg(version_arg())
                .arg(
                    Arg::new("keep_backup")
                        .long("keep-backup")
                        .action(ArgAction::SetTrue)
                        .help("Keep the replaced version for `cmam restore`"),
                ),
        )
        .subcommand(
            Command::new("uninstall")
                .about("Remove an installed package (a backup is kept)")
                .arg(name_arg()),
        )
        .subcommand(
            Command::new("restore")
                .about("Put the most recent backup of a package back in place")
                .arg(name_arg()),
        )
        .subcommand(
            Command::new("self-update")
                .about("Update cmam itself (takes effect on the next launch)")
                .arg(version_arg())
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Stage even if the running binary is already that build"),
                ),
        )
        .subcommand(Command::new("list").about("List installed packages"))
        .subcommand(
            Command::new("info")
                .about("Show details of an installed package")
                .arg(name_arg()),
        )
        .subcommand(
            Command::new("history")
                .about("Show transaction history")
                .arg(Arg::new("name").help("Only show transactions for this package")),
        )
        .subcommand(
            Command::new("doctor")
                .about("Check the installation for problems")
                .arg(
                    Arg::new("fix")
                        .long("fix")
                        .action(ArgAction::SetTrue)
                        .help("Rebuild the manifest from verifiable install markers"),
                ),
        )
        .subcommand(
            Command::new("cache")
                .about("Inspect or clean the download cache")
                .subcommand(Command::new("list").about("List cached artifacts"))
                .subcommand(
                    Command::new("clean")
                        .about("Evict old and least recently used artifacts")
                        .arg(
                            Arg::new("max_age_days")
                                .long("max-age-days")
                                .help("Evict entries not used for this many days"),
                        )
                        .arg(
                            Arg::new("max_bytes")
                                .long("max-bytes")
                                .help("Shrink the cache below this many bytes"),
                        ),
                ),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Man page goes to OUT_DIR; packaging copies it from there
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("cmam.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
