// Rebuild when migrations change so `sqlx::migrate!` picks them up.
fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
