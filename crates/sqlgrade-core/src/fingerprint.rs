use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub hex: String,
    pub components: Vec<String>,
}

pub fn sha256_hex(s: &str) -> String {
    let mut h = Sha256::new();
    h.update(s.as_bytes());
    hex::encode(h.finalize())
}

/// Identity of a submission's content, used to tell a replay from a reused id.
pub struct Context<'a> {
    pub problem_id: &'a str,
    pub user_id: &'a str,
    pub sql: &'a str,
}

pub fn compute(ctx: Context<'_>) -> Fingerprint {
    let parts = vec![
        format!("problem={}", ctx.problem_id),
        format!("user={}", ctx.user_id),
        // Exact text; whitespace changes are a different submission.
        format!("sql={}", ctx.sql),
    ];
    let hex = sha256_hex(&parts.join("\n"));
    Fingerprint {
        hex,
        components: parts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(problem: &str, user: &str, sql: &str) -> String {
        compute(Context {
            problem_id: problem,
            user_id: user,
            sql,
        })
        .hex
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_sensitive() {
        let a = fp("p1", "u1", "SELECT 1");
        assert_eq!(a, fp("p1", "u1", "SELECT 1"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, fp("p1", "u1", "SELECT 2"));
        assert_ne!(a, fp("p2", "u1", "SELECT 1"));
        assert_ne!(a, fp("p1", "u2", "SELECT 1"));
    }

    #[test]
    fn test_fields_do_not_bleed_into_each_other() {
        assert_ne!(fp("p\nuser=x", "", "q"), fp("p", "x", "q"));
    }
}
