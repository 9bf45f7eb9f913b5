//! `--generate-hash`: turn a password into the bcrypt hash stored in
//! `authorization.password_hash`.

use std::io::{self, BufRead, Write};

use anyhow::{Context, bail};

pub const MIN_PASSWORD_LEN: usize = 5;

fn prompt(input: &mut impl BufRead, label: &str) -> anyhow::Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;

    let mut line = String::new();
    input.read_line(&mut line).context("failed to read password")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Reads the password twice and returns its hash.
pub fn read_and_hash(input: &mut impl BufRead) -> anyhow::Result<String> {
    let password = prompt(input, "Password")?;
    if password.chars().count() < MIN_PASSWORD_LEN {
        bail!("password must be at least {} characters", MIN_PASSWORD_LEN);
    }

    let confirmation = prompt(input, "Repeat password")?;
    if password != confirmation {
        bail!("passwords do not match");
    }

    bcrypt::hash(&password, bcrypt::DEFAULT_COST).context("failed to hash password")
}

pub fn handle_generate_hash() {
    let stdin = io::stdin();
    match read_and_hash(&mut stdin.lock()) {
        Ok(hash) => {
            println!("╔═══════════════════════════════════════════════════════════════════╗");
            println!("║                          Password Hash                            ║");
            println!("╠═══════════════════════════════════════════════════════════════════╣");
            println!("  {}", hash);
            println!("╠═══════════════════════════════════════════════════════════════════╣");
            println!("║  Put it in config.json under authorization.password_hash          ║");
            println!("╚═══════════════════════════════════════════════════════════════════╝");
        }
        Err(e) => eprintln!("Error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_matching_passwords_are_hashed() {
        let hash = read_and_hash(&mut Cursor::new("secret1\nsecret1\n")).unwrap();
        assert!(bcrypt::verify("secret1", &hash).unwrap());
    }

    #[test]
    fn test_short_password_rejected() {
        assert!(read_and_hash(&mut Cursor::new("abc\nabc\n")).is_err());
    }

    #[test]
    fn test_mismatch_rejected() {
        assert!(read_and_hash(&mut Cursor::new("secret1\nsecret2\n")).is_err());
    }
}
