//! Anchor manager: placeholder/actual chain pairs under a root chain.
//!
//! The placeholder is linked into the root chain exactly once, at install
//! time, and never moves; enabling an anchor appends a jump from the
//! placeholder to the actual chain, disabling flushes the placeholder, and
//! replacing repopulates the actual chain. None of those operations can
//! change the anchor's position in the root chain.

use super::{ANCHOR_NAME, Family, Firewall, IpVersion, Logs, ShellOps, Table};

/// Placeholder chain for `anchor`; holds at most a jump to the actual chain.
pub(super) fn placeholder_chain(anchor: &str) -> String {
    format!("{ANCHOR_NAME}.a.{anchor}")
}

/// Actual chain for `anchor`; holds the concrete rules.
pub(super) fn actual_chain(anchor: &str) -> String {
    format!("{ANCHOR_NAME}.{anchor}")
}

impl<S: ShellOps> Firewall<S> {
    /// Create the anchor pair and link the placeholder into `root_chain`.
    ///
    /// Placeholders are appended, so anchor precedence is exactly the order
    /// of `install_anchor` calls against a given root chain.
    pub async fn install_anchor(
        &self,
        ip: IpVersion,
        anchor: &str,
        rules: &[String],
        table: Table,
        root_chain: &str,
    ) {
        for family in ip.families() {
            self.install_anchor_for(*family, anchor, rules, table, root_chain).await;
        }
    }

    async fn install_anchor_for(
        &self,
        family: Family,
        anchor: &str,
        rules: &[String],
        table: Table,
        root_chain: &str,
    ) {
        let placeholder = placeholder_chain(anchor);
        let actual = actual_chain(anchor);

        // The placeholder stays locked in place inside the root chain,
        // fixing this anchor's precedence for good.
        self.create_chain_for(family, &placeholder, table).await;
        self.link_chain_for(family, &placeholder, root_chain, false, table).await;

        // The actual chain carries the rules and may be repopulated freely.
        self.create_chain_for(family, &actual, table).await;
        let cmd = family.command();
        let table_name = table.name();
        for rule in rules {
            self.shell
                .bash(&format!("{cmd} -w -A {actual} {rule} -t {table_name}"), Logs::Print)
                .await;
        }
    }

    /// Remove the anchor pair and its link from `root_chain`.
    pub async fn uninstall_anchor(&self, ip: IpVersion, anchor: &str, table: Table, root_chain: &str) {
        for family in ip.families() {
            let placeholder = placeholder_chain(anchor);
            let actual = actual_chain(anchor);
            self.unlink_chain_for(*family, &placeholder, root_chain, table).await;
            self.delete_chain_for(*family, &placeholder, table).await;
            self.delete_chain_for(*family, &actual, table).await;
        }
    }

    /// Jump from the placeholder into the actual chain; idempotent.
    pub async fn enable_anchor(&self, ip: IpVersion, anchor: &str, table: Table) {
        for family in ip.families() {
            if self.is_anchor_enabled_for(*family, anchor, table).await {
                tracing::debug!(anchor, family = family.tag(), "anchor already on");
                continue;
            }
            tracing::info!(anchor, family = family.tag(), "anchor off -> on");
            let cmd = family.command();
            let placeholder = placeholder_chain(anchor);
            let actual = actual_chain(anchor);
            let table_name = table.name();
            self.shell
                .bash(
                    &format!("{cmd} -w -A {placeholder} -j {actual} -t {table_name}"),
                    Logs::Print,
                )
                .await;
        }
    }

    /// Flush the placeholder so nothing reaches the actual chain; idempotent.
    pub async fn disable_anchor(&self, ip: IpVersion, anchor: &str, table: Table) {
        for family in ip.families() {
            if !self.is_anchor_enabled_for(*family, anchor, table).await {
                tracing::debug!(anchor, family = family.tag(), "anchor already off");
                continue;
            }
            tracing::info!(anchor, family = family.tag(), "anchor on -> off");
            let cmd = family.command();
            let placeholder = placeholder_chain(anchor);
            let table_name = table.name();
            self.shell
                .bash(&format!("{cmd} -w -F {placeholder} -t {table_name}"), Logs::Print)
                .await;
        }
    }

    pub async fn set_anchor_enabled(&self, ip: IpVersion, anchor: &str, enabled: bool, table: Table) {
        if enabled {
            self.enable_anchor(ip, anchor, table).await;
        } else {
            self.disable_anchor(ip, anchor, table).await;
        }
    }

    /// Whether the placeholder currently jumps to the actual chain, for
    /// every family `ip` selects.
    pub async fn is_anchor_enabled(&self, ip: IpVersion, anchor: &str, table: Table) -> bool {
        for family in ip.families() {
            if !self.is_anchor_enabled_for(*family, anchor, table).await {
                return false;
            }
        }
        true
    }

    async fn is_anchor_enabled_for(&self, family: Family, anchor: &str, table: Table) -> bool {
        let cmd = family.command();
        let placeholder = placeholder_chain(anchor);
        let actual = actual_chain(anchor);
        let table_name = table.name();
        self.shell
            .bash(
                &format!("{cmd} -w -C {placeholder} -j {actual} -t {table_name} 2> /dev/null"),
                Logs::Suppress,
            )
            .await
            == 0
    }

    /// Flush the actual chain and append `new_rules` in order.
    ///
    /// The placeholder's jump target never changes, so the kernel observes a
    /// briefly empty anchor but never a dangling one.
    pub async fn replace_anchor(&self, ip: IpVersion, anchor: &str, new_rules: &[String], table: Table) {
        for family in ip.families() {
            let cmd = family.command();
            let actual = actual_chain(anchor);
            let table_name = table.name();
            self.shell
                .bash(&format!("{cmd} -w -F {actual} -t {table_name}"), Logs::Print)
                .await;
            for rule in new_rules {
                self.shell
                    .bash(&format!("{cmd} -w -A {actual} {rule} -t {table_name}"), Logs::Print)
                    .await;
            }
        }
    }
}
