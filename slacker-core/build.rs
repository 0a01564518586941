fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    // Deployments built outside a git checkout pass the revision in explicitly
    println!("cargo:rerun-if-env-changed=SLACKER_GIT_HASH");
    if let Ok(hash) = std::env::var("SLACKER_GIT_HASH") {
        println!("cargo:rustc-env=SLACKER_GIT_HASH={}", hash);
    }
}
