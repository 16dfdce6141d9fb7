//! Chain primitives: create, delete, link and unlink named chains.
//!
//! All operations are idempotent and report failure as a non-zero status
//! rather than an error; a benign failure (deleting an absent chain) must
//! never abort a surrounding install or teardown.

use super::{Family, Firewall, IpVersion, Logs, ShellOps, Table};

impl<S: ShellOps> Firewall<S> {
    /// Create `chain` in `table`, or flush it if it already exists.
    pub async fn create_chain(&self, ip: IpVersion, chain: &str, table: Table) -> i32 {
        let mut status = 0;
        for family in ip.families() {
            let rc = self.create_chain_for(*family, chain, table).await;
            if status == 0 {
                status = rc;
            }
        }
        status
    }

    pub(super) async fn create_chain_for(&self, family: Family, chain: &str, table: Table) -> i32 {
        let cmd = family.command();
        let table = table.name();
        self.shell
            .bash(
                &format!("{cmd} -w -N {chain} -t {table} || {cmd} -w -F {chain} -t {table}"),
                Logs::Print,
            )
            .await
    }

    /// Flush and remove `chain` if it exists; no-op otherwise.
    pub async fn delete_chain(&self, ip: IpVersion, chain: &str, table: Table) -> i32 {
        let mut status = 0;
        for family in ip.families() {
            let rc = self.delete_chain_for(*family, chain, table).await;
            if status == 0 {
                status = rc;
            }
        }
        status
    }

    pub(super) async fn delete_chain_for(&self, family: Family, chain: &str, table: Table) -> i32 {
        let cmd = family.command();
        let table = table.name();
        self.shell
            .bash(
                &format!(
                    "if {cmd} -w -L {chain} -n -t {table} > /dev/null 2> /dev/null ; then {cmd} -w -F {chain} -t {table} && {cmd} -w -X {chain} -t {table}; fi"
                ),
                Logs::Print,
            )
            .await
    }

    /// Ensure a single `parent -> chain` jump exists.
    ///
    /// With `must_be_first` the jump is guaranteed to be rule #1 of `parent`,
    /// even when a stale jump sits further down: insert at position 1, then
    /// delete one other jump by line number (rule numbers shift on every
    /// delete, so only a single stale jump is removed per pass).
    pub async fn link_chain(
        &self,
        ip: IpVersion,
        chain: &str,
        parent: &str,
        must_be_first: bool,
        table: Table,
    ) -> i32 {
        let mut status = 0;
        for family in ip.families() {
            let rc = self.link_chain_for(*family, chain, parent, must_be_first, table).await;
            if status == 0 {
                status = rc;
            }
        }
        status
    }

    pub(super) async fn link_chain_for(
        &self,
        family: Family,
        chain: &str,
        parent: &str,
        must_be_first: bool,
        table: Table,
    ) -> i32 {
        let cmd = family.command();
        let table = table.name();
        if must_be_first {
            // 1. Check whether rule #1 of the parent already jumps to us.
            // 2. If not, insert the jump at position 1.
            // 3. Delete a single stale jump at an index > 1, if any; xargs -r
            //    keeps an empty parent from invoking the delete at all.
            self.shell
                .bash(
                    &format!(
                        "if ! {cmd} -w -L {parent} -n --line-numbers -t {table} 2> /dev/null | awk 'int($1) == 1 && $2 == \"{chain}\" {{ found=1 }} END {{ if(found==1) {{ exit 0 }} else {{ exit 1 }} }}' ; then {cmd} -w -I {parent} -j {chain} -t {table} && {cmd} -w -L {parent} -n --line-numbers -t {table} 2> /dev/null | awk 'int($1) > 1 && $2 == \"{chain}\" {{ print $1; exit }}' | xargs -r {cmd} -w -t {table} -D {parent} ; fi"
                    ),
                    Logs::Print,
                )
                .await
        } else {
            self.shell
                .bash(
                    &format!(
                        "if ! {cmd} -w -C {parent} -j {chain} -t {table} 2> /dev/null ; then {cmd} -w -A {parent} -j {chain} -t {table}; fi"
                    ),
                    Logs::Print,
                )
                .await
        }
    }

    /// Remove a single `parent -> chain` jump if present.
    pub async fn unlink_chain(&self, ip: IpVersion, chain: &str, parent: &str, table: Table) -> i32 {
        let mut status = 0;
        for family in ip.families() {
            let rc = self.unlink_chain_for(*family, chain, parent, table).await;
            if status == 0 {
                status = rc;
            }
        }
        status
    }

    pub(super) async fn unlink_chain_for(
        &self,
        family: Family,
        chain: &str,
        parent: &str,
        table: Table,
    ) -> i32 {
        let cmd = family.command();
        let table = table.name();
        self.shell
            .bash(
                &format!(
                    "if {cmd} -w -C {parent} -j {chain} -t {table} 2> /dev/null ; then {cmd} -w -D {parent} -j {chain} -t {table}; fi"
                ),
                Logs::Print,
            )
            .await
    }

    /// Unlink `chain` from `parent`, then delete it.
    pub async fn unlink_and_delete_chain(
        &self,
        ip: IpVersion,
        chain: &str,
        parent: &str,
        table: Table,
    ) -> i32 {
        self.unlink_chain(ip, chain, parent, table).await;
        self.delete_chain(ip, chain, table).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::mocks::MockShellOps;
    use super::*;

    fn firewall() -> (Firewall<MockShellOps>, MockShellOps) {
        let shell = MockShellOps::new();
        (Firewall::new(shell.clone()), shell)
    }

    #[tokio::test]
    async fn create_chain_issues_new_or_flush() {
        let (fw, shell) = firewall();

        fw.create_chain(IpVersion::V4, "aegisvpn.test", Table::Filter).await;

        assert_eq!(
            shell.commands(),
            vec![
                "iptables -w -N aegisvpn.test -t filter || iptables -w -F aegisvpn.test -t filter"
                    .to_string()
            ]
        );
    }

    #[tokio::test]
    async fn both_fans_out_to_v4_then_v6() {
        let (fw, shell) = firewall();

        fw.create_chain(IpVersion::Both, "aegisvpn.test", Table::Nat).await;

        let commands = shell.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].starts_with("iptables "));
        assert!(commands[1].starts_with("ip6tables "));
    }

    #[tokio::test]
    async fn both_returns_first_non_zero_status() {
        let (fw, shell) = firewall();
        shell.set_status(
            "iptables -w -N aegisvpn.test -t filter || iptables -w -F aegisvpn.test -t filter",
            2,
        );

        let status = fw.create_chain(IpVersion::Both, "aegisvpn.test", Table::Filter).await;

        assert_eq!(status, 2);
        // Both families are still attempted.
        assert_eq!(shell.commands().len(), 2);
    }

    #[tokio::test]
    async fn link_chain_appends_only_when_jump_is_missing() {
        let (fw, shell) = firewall();

        fw.link_chain(IpVersion::V4, "aegisvpn.child", "aegisvpn.parent", false, Table::Filter)
            .await;

        assert_eq!(
            shell.commands(),
            vec![
                "if ! iptables -w -C aegisvpn.parent -j aegisvpn.child -t filter 2> /dev/null ; then iptables -w -A aegisvpn.parent -j aegisvpn.child -t filter; fi"
                    .to_string()
            ]
        );
    }

    #[tokio::test]
    async fn link_chain_first_guards_stale_jump_deletion() {
        let (fw, shell) = firewall();

        fw.link_chain(IpVersion::V4, "aegisvpn.OUTPUT", "OUTPUT", true, Table::Filter).await;

        let commands = shell.commands();
        assert_eq!(commands.len(), 1);
        // Inserts at the top and removes a stale duplicate by line number.
        assert!(commands[0].contains("iptables -w -I OUTPUT -j aegisvpn.OUTPUT -t filter"));
        assert!(commands[0].contains("int($1) == 1 && $2 == \"aegisvpn.OUTPUT\""));
        // An empty line-number list must not invoke the delete.
        assert!(commands[0].contains("xargs -r"));
        assert!(commands[0].contains("-D OUTPUT"));
    }

    #[tokio::test]
    async fn unlink_chain_deletes_only_existing_jump() {
        let (fw, shell) = firewall();

        fw.unlink_chain(IpVersion::V6, "aegisvpn.child", "OUTPUT", Table::Mangle).await;

        assert_eq!(
            shell.commands(),
            vec![
                "if ip6tables -w -C OUTPUT -j aegisvpn.child -t mangle 2> /dev/null ; then ip6tables -w -D OUTPUT -j aegisvpn.child -t mangle; fi"
                    .to_string()
            ]
        );
    }

    #[tokio::test]
    async fn unlink_and_delete_runs_unlink_then_delete() {
        let (fw, shell) = firewall();

        fw.unlink_and_delete_chain(IpVersion::V4, "aegisvpn.child", "OUTPUT", Table::Filter).await;

        let commands = shell.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].contains("-D OUTPUT -j aegisvpn.child"));
        assert!(commands[1].contains("-X aegisvpn.child"));
    }
}
