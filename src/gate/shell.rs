//! The server-side restricted shell installed on golden images.
//!
//! The script below becomes the login shell of the read-only user. It
//! refuses interactive sessions, rejects unquoted output redirection, and
//! blocks destructive command prefixes in every pipeline segment before
//! handing the command to `bash -c`. It is deliberately independent of the
//! client-side validator: either layer alone must hold the line.

/// Absolute path the shell is installed to on golden images.
pub const RESTRICTED_SHELL_PATH: &str = "/usr/local/bin/fluid-restricted-shell";

/// Login account the shell is bound to.
pub const READONLY_USER: &str = "fluid-readonly";

/// Where the CA public key is written on golden images.
pub const CA_TRUST_PATH: &str = "/etc/ssh/fluid_ca.pub";

/// Per-user principals directory referenced from sshd_config.
pub const PRINCIPALS_DIR: &str = "/etc/ssh/fluid_principals";

/// The restricted shell script, installed verbatim.
///
/// Exit code 77 marks a policy rejection so callers can tell "blocked"
/// apart from the wrapped command's own failure.
pub const RESTRICTED_SHELL_SCRIPT: &str = r#"#!/usr/bin/env bash
# Login shell for the fluid-readonly user. Only non-interactive,
# non-destructive commands pass; everything else is refused.
set -u
set -f

deny() {
    echo "fluid-restricted-shell: blocked: $1" >&2
    exit 77
}

[ -n "${SSH_ORIGINAL_COMMAND:-}" ] || deny "interactive login is not permitted"

CMD="$SSH_ORIGINAL_COMMAND"

# Walk the command once, tracking quote state. Unquoted '>' is refused
# outright; unquoted '|', ';', '&' end the current segment.
segments=()
seg=""
in_s=0
in_d=0
prev=""
i=0
while [ "$i" -lt "${#CMD}" ]; do
    ch="${CMD:$i:1}"
    if [ "$in_s" -eq 1 ]; then
        [ "$ch" = "'" ] && in_s=0
        seg+="$ch"
    elif [ "$in_d" -eq 1 ]; then
        if [ "$ch" = '"' ] && [ "$prev" != '\' ]; then
            in_d=0
        fi
        seg+="$ch"
    else
        case "$ch" in
            "'") in_s=1; seg+="$ch" ;;
            '"') in_d=1; seg+="$ch" ;;
            '>') deny "output redirection" ;;
            '|'|';'|'&') segments+=("$seg"); seg="" ;;
            *) seg+="$ch" ;;
        esac
    fi
    prev="$ch"
    i=$((i + 1))
done
segments+=("$seg")

# Destructive prefixes. Multi-word entries pin a subcommand; single words
# block the tool entirely.
blocked=(
    "sudo" "su" "rm" "rmdir" "mv" "cp" "dd" "ln" "touch" "truncate" "tee"
    "chmod" "chown" "chgrp" "chattr" "mkfs" "mkswap" "mount" "umount"
    "kill" "pkill" "killall" "reboot" "shutdown" "poweroff" "halt" "init"
    "useradd" "usermod" "userdel" "groupadd" "groupdel" "passwd" "visudo"
    "crontab" "at" "iptables" "ip6tables" "nft" "insmod" "rmmod" "modprobe"
    "apt-get" "aptitude" "yum" "dnf" "npm" "service"
    "apt install" "apt remove" "apt purge" "apt upgrade" "apt update"
    "apt autoremove"
    "dpkg -i" "dpkg --install" "dpkg -r" "dpkg --remove" "dpkg -P"
    "dpkg --purge" "dpkg --configure"
    "pip install" "pip uninstall" "pip3 install" "pip3 uninstall"
    "snap install" "snap remove" "snap refresh"
    "systemctl start" "systemctl stop" "systemctl restart" "systemctl reload"
    "systemctl enable" "systemctl disable" "systemctl mask"
    "systemctl daemon-reload" "systemctl edit" "systemctl set-property"
    "sysctl -w"
    "vi" "vim" "nano" "emacs" "ed"
    "python" "python3" "perl" "ruby" "node" "bash" "sh" "zsh" "ksh" "dash"
    "exec" "eval" "source" "env"
)

for seg in "${segments[@]}"; do
    # shellcheck disable=SC2086
    set -- $seg
    # Skip leading KEY=VALUE assignments.
    while [ "$#" -gt 0 ]; do
        case "$1" in
            [A-Za-z_]*=*) shift ;;
            *) break ;;
        esac
    done
    [ "$#" -eq 0 ] && continue

    first="${1##*/}"
    # The shell concatenates quoted pieces; compare with quotes removed.
    first="${first//\'/}"
    first="${first//\"/}"
    shift
    norm="$first"
    [ "$#" -gt 0 ] && norm="$first $*"

    for pat in "${blocked[@]}"; do
        case "$norm" in
            "$pat"|"$pat "*) deny "command '$pat' is not permitted" ;;
        esac
    done

    # find is read-only until a write or exec predicate appears.
    if [ "$first" = "find" ]; then
        for t in "$@"; do
            t="${t//\'/}"
            t="${t//\"/}"
            case "$t" in
                -exec|-execdir|-ok|-okdir|-delete|-fprintf|-fprint|-fprint0|-fls)
                    deny "find predicate '$t' is not permitted" ;;
            esac
        done
    fi
done

exec /bin/bash -c "$SSH_ORIGINAL_COMMAND"
"#;

/// Exit code the script uses for policy rejections.
pub const BLOCKED_EXIT_CODE: i32 = 77;
