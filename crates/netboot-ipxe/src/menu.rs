//! Interactive iPXE boot menu
//!
//! Served to machines that have no profile yet. Choosing a role chains back
//! to the boot service with `type` set, which is how control-plane nodes
//! announce themselves.

use crate::error::Result;
use minijinja::{context, Environment};
use std::net::IpAddr;

const MENU_TEMPLATE: &str = r#"#!ipxe
isset ${proxydhcp/next-server} || goto start
set next-server ${proxydhcp/next-server}
set filename ${proxydhcp/filename}

:start
menu iPXE boot menu for Talos
item --gap                      Talos Nodes
item --key i init               Bootstrap Node
item --key c controlplane       Master Node
item --key w worker             Worker Node
item --gap                      Other
item --key s shell              iPXE Shell
item --key r reboot             Reboot
item --key e exit               Exit
choose --timeout 0 --default worker selected || goto cancel
set menu-timeout 0
goto ${selected}
{% for role in roles %}
:{{ role }}
chain http://{{ server_ip }}:{{ http_port }}/ipxe?uuid=${uuid}&ip=${ip}&mac=${mac:hexhyp}&domain=${domain}&hostname=${hostname}&serial=${serial}&type={{ role }}
{% endfor %}
:reboot
reboot

:shell
shell

:exit
exit
"#;

/// Roles offered by the menu, in order
pub const MENU_ROLES: [&str; 3] = ["init", "controlplane", "worker"];

/// Compiled boot menu template
#[derive(Debug)]
pub struct BootMenu {
    env: Environment<'static>,
    http_port: u16,
}

impl BootMenu {
    pub fn new(http_port: u16) -> Result<Self> {
        Self::from_source(MENU_TEMPLATE, http_port)
    }

    /// Build a menu from custom template source
    ///
    /// The template sees `server_ip`, `http_port` and `roles`.
    pub fn from_source(source: &'static str, http_port: u16) -> Result<Self> {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.add_template("menu.ipxe", source)?;
        Ok(Self { env, http_port })
    }

    /// Render the menu pointing back at `server_ip`
    pub fn render(&self, server_ip: IpAddr) -> Result<String> {
        let template = self.env.get_template("menu.ipxe")?;
        Ok(template.render(context! {
            server_ip => server_ip.to_string(),
            http_port => self.http_port,
            roles => MENU_ROLES,
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_menu_substitutes_server_address() {
        let menu = BootMenu::new(8080).unwrap();
        let script = menu
            .render(IpAddr::V4(Ipv4Addr::new(192, 168, 123, 1)))
            .unwrap();

        assert!(script.starts_with("#!ipxe\n"));
        assert!(script.contains("choose --timeout 0 --default worker selected || goto cancel"));
        for role in MENU_ROLES {
            assert!(script.contains(&format!(
                ":{role}\nchain http://192.168.123.1:8080/ipxe?uuid=${{uuid}}&ip=${{ip}}&mac=${{mac:hexhyp}}&domain=${{domain}}&hostname=${{hostname}}&serial=${{serial}}&type={role}\n"
            )));
        }
        assert!(script.contains(":shell\nshell\n"));
        assert!(!script.contains("{{"));
    }

    #[test]
    fn test_broken_template_is_an_error() {
        assert!(BootMenu::from_source("{% for %}", 8080).is_err());

        let menu = BootMenu::from_source("{{ server_ip | nosuchfilter }}", 8080);
        let failed = match menu {
            Err(_) => true,
            Ok(menu) => menu.render(IpAddr::V4(Ipv4Addr::LOCALHOST)).is_err(),
        };
        assert!(failed);
    }
}
