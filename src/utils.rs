#[derive(Display, PartialEq, Eq)]
#[display("{:?}", self)]
/// Outputs bytes as escaped ascii strings
pub struct EscapedBytes<'a>(pub &'a [u8]);

impl std::fmt::Debug for EscapedBytes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut end_zeroes = 0;
        if cfg!(any(fuzzing, test)) {
            end_zeroes = self.0.iter().rev().take_while(|b| **b == 0).count();
            if end_zeroes <= 5 {
                end_zeroes = 0;
            }
        }
        for &b in &self.0[..self.0.len() - end_zeroes] {
            write!(f, "{}", std::ascii::escape_default(b))?
        }
        if end_zeroes != 0 {
            write!(f, "…\\0*{end_zeroes}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escaped_bytes() {
        assert_eq!(format!("{:?}", EscapedBytes(b"a\x00b")), "a\\x00b");
        assert_eq!(
            format!("{:?}", EscapedBytes(b"k\x00\x00\x00\x00\x00\x00\x00")),
            "k…\\0*7"
        );
    }
}
