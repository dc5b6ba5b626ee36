//! Backend probe

use anyhow::Result;
use kiln_compute::{describe_backends, detect_backends};

pub fn run(verbose: bool) -> Result<()> {
    print!("{}", describe_backends());

    if verbose {
        let available = detect_backends().iter().filter(|b| b.available).count();
        println!("{available} of 3 backends have a capable device");
    }
    Ok(())
}
