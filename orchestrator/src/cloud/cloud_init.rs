//! cloud-init user data
//!
//! The only trust bootstrap the image gets: install our public key for root,
//! turn off password logins and restart sshd.

/// Render the `#cloud-config` document for a job VM. Without a public key
/// the VM still boots locked down, and the job fails at the SSH stage.
pub fn user_data(public_key: Option<&str>) -> String {
    let keys = match public_key.map(|k| k.trim().replace('"', "")) {
        Some(key) if !key.is_empty() => format!(
            "users:\n  - name: root\n    ssh_authorized_keys:\n      - \"{}\"\n",
            key
        ),
        _ => String::new(),
    };
    format!(
        r#"#cloud-config
ssh_pwauth: false
disable_root: false
{keys}runcmd:
  - sed -i -E 's/^#?PasswordAuthentication .*/PasswordAuthentication no/' /etc/ssh/sshd_config
  - sed -i -E 's/^#?PermitRootLogin .*/PermitRootLogin prohibit-password/' /etc/ssh/sshd_config
  - sed -i -E 's/^#?KbdInteractiveAuthentication .*/KbdInteractiveAuthentication no/' /etc/ssh/sshd_config
  - passwd -l root
  - systemctl restart ssh || systemctl restart sshd
"#
    )
}
