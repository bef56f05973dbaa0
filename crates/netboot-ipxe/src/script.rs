//! Plain iPXE scripts

use crate::profile::Profile;
use std::fmt::Write;

/// First script every iPXE client fetches: chain to the profile lookup,
/// announcing the machine's identity
pub fn chain_script(base_url: &str) -> String {
    format!(
        "#!ipxe\nchain {}/ipxe?uuid=${{uuid}}&ip=${{ip}}&mac=${{mac:hexhyp}}&domain=${{domain}}&hostname=${{hostname}}&serial=${{serial}}\n",
        base_url.trim_end_matches('/')
    )
}

/// Boot script for a matched profile
pub fn profile_script(profile: &Profile) -> String {
    let boot = &profile.boot;
    let mut script = String::from("#!ipxe\n");

    let mut kernel = format!("kernel {}", boot.kernel);
    for arg in &boot.args {
        let _ = write!(kernel, " {}", arg);
    }
    script.push_str(&kernel);
    script.push('\n');

    for initrd in &boot.initrd {
        let _ = writeln!(script, "initrd {}", initrd);
    }
    script.push_str("boot\n");
    script
}
