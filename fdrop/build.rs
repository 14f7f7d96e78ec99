use std::{env, fs, path::Path};

use anyhow::{Context as _, Result, anyhow};
use aya_build::{Package, Toolchain};

const EBPF_PACKAGE: &str = "fdrop-ebpf";
const NO_EMBEDDED_CFG: &str = "fdrop_no_embedded_ebpf";
const SKIP_ENV: &str = "FDROP_SKIP_EBPF_BUILD";

fn main() -> Result<()> {
    println!("cargo::rustc-check-cfg=cfg({NO_EMBEDDED_CFG})");
    println!("cargo:rerun-if-env-changed={SKIP_ENV}");

    // Without bpf-linker the classifier cannot be built; the loader then
    // needs --filename at runtime.
    if env::var_os(SKIP_ENV).is_some() || !on_path("bpf-linker") {
        println!(
            "cargo:warning=bpf-linker not found or {SKIP_ENV} set; \
             fdrop-loader is built without an embedded classifier"
        );
        println!("cargo:rustc-cfg={NO_EMBEDDED_CFG}");
        return Ok(());
    }

    let cargo_metadata::Metadata { packages, .. } = cargo_metadata::MetadataCommand::new()
        .no_deps()
        .exec()
        .context("MetadataCommand::exec")?;
    let ebpf_package = packages
        .into_iter()
        .find(|cargo_metadata::Package { name, .. }| name.as_str() == EBPF_PACKAGE)
        .ok_or_else(|| anyhow!("{EBPF_PACKAGE} package not found"))?;
    let cargo_metadata::Package {
        name,
        manifest_path,
        ..
    } = ebpf_package;
    let root_dir = manifest_path
        .parent()
        .ok_or_else(|| anyhow!("no parent for {manifest_path}"))?;

    // The classifier shares its frame layout with the common crate.
    if let Some(workspace) = root_dir.parent() {
        println!("cargo:rerun-if-changed={workspace}/fdrop-common/src");
    }

    let ebpf_package = Package {
        name: name.as_str(),
        root_dir: root_dir.as_str(),
        ..Default::default()
    };
    aya_build::build_ebpf([ebpf_package], Toolchain::default())
}

fn on_path(binary: &str) -> bool {
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| is_file(&dir.join(binary))))
        .unwrap_or(false)
}

fn is_file(path: &Path) -> bool {
    fs::metadata(path).map(|meta| meta.is_file()).unwrap_or(false)
}
