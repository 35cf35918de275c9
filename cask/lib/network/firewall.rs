use ipnetwork::Ipv4Network;
use tokio::process::Command;

use crate::{CaskError, CaskResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The packet-filter tool driven for NAT and forwarding rules.
const IPTABLES_BIN: &str = "iptables";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One firewall rule: an optional table plus the chain-and-match arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    /// The iptables table, `None` for the default filter table.
    pub table: Option<&'static str>,

    /// Chain name followed by the match/target arguments.
    pub spec: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Ensures the host NAT and forwarding rules for container traffic exist.
/// Each rule is checked first and appended only when absent, so repeated host
/// setup leaves the rule set unchanged.
pub async fn ensure_host_rules(
    bridge_name: &str,
    bridge_cidr: &Ipv4Network,
    public_iface: &str,
) -> CaskResult<()> {
    for rule in host_rules(bridge_name, bridge_cidr, public_iface) {
        ensure_rule(&rule).await?;
    }
    Ok(())
}

/// The three rules that give containers outbound connectivity: source-NAT on
/// the public interface, bridge→public forwarding, and the return path for
/// established flows.
pub fn host_rules(
    bridge_name: &str,
    bridge_cidr: &Ipv4Network,
    public_iface: &str,
) -> Vec<FirewallRule> {
    let subnet = format!("{}/{}", bridge_cidr.network(), bridge_cidr.prefix());

    vec![
        FirewallRule {
            table: Some("nat"),
            spec: str_args(&[
                "POSTROUTING",
                "-s",
                &subnet,
                "-o",
                public_iface,
                "-j",
                "MASQUERADE",
            ]),
        },
        FirewallRule {
            table: None,
            spec: str_args(&[
                "FORWARD",
                "-i",
                bridge_name,
                "-o",
                public_iface,
                "-j",
                "ACCEPT",
            ]),
        },
        FirewallRule {
            table: None,
            spec: str_args(&[
                "FORWARD",
                "-i",
                public_iface,
                "-o",
                bridge_name,
                "-m",
                "state",
                "--state",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ]),
        },
    ]
}

async fn ensure_rule(rule: &FirewallRule) -> CaskResult<()> {
    if run_iptables(rule, "-C").await? {
        tracing::debug!(?rule.spec, "firewall rule already present");
        return Ok(());
    }

    tracing::info!(?rule.spec, "inserting firewall rule");
    if !run_iptables(rule, "-A").await? {
        return Err(CaskError::Firewall(format!(
            "failed to append rule: {:?}",
            rule.spec
        )));
    }

    Ok(())
}

async fn run_iptables(rule: &FirewallRule, action: &str) -> CaskResult<bool> {
    let mut command = Command::new(IPTABLES_BIN);
    if let Some(table) = rule.table {
        command.arg("-t").arg(table);
    }
    command.arg(action);
    command.args(&rule.spec);

    let status = command
        .status()
        .await
        .map_err(|e| CaskError::Firewall(format!("failed to run {}: {}", IPTABLES_BIN, e)))?;

    Ok(status.success())
}

fn str_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_rules_match_the_nat_contract() {
        let bridge_cidr: Ipv4Network = "172.20.0.1/24".parse().unwrap();
        let rules = host_rules("cbr0", &bridge_cidr, "eth0");

        assert_eq!(rules.len(), 3);

        assert_eq!(rules[0].table, Some("nat"));
        assert_eq!(
            rules[0].spec,
            vec![
                "POSTROUTING",
                "-s",
                "172.20.0.0/24",
                "-o",
                "eth0",
                "-j",
                "MASQUERADE"
            ]
        );

        assert_eq!(rules[1].table, None);
        assert_eq!(
            rules[1].spec,
            vec!["FORWARD", "-i", "cbr0", "-o", "eth0", "-j", "ACCEPT"]
        );

        assert_eq!(
            rules[2].spec,
            vec![
                "FORWARD",
                "-i",
                "eth0",
                "-o",
                "cbr0",
                "-m",
                "state",
                "--state",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT"
            ]
        );
    }

    #[test]
    fn test_masquerade_source_is_the_network_address() {
        // The bridge carries a host address; the NAT match must use the
        // network address of the subnet.
        let bridge_cidr: Ipv4Network = "10.88.3.1/16".parse().unwrap();
        let rules = host_rules("cask0", &bridge_cidr, "enp3s0");
        assert_eq!(rules[0].spec[2], "10.88.0.0/16");
    }
}
