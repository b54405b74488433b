use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Digit runs this long look like phone numbers, account ids and the like.
const MIN_MASKED_DIGITS: usize = 7;
const VISIBLE_SUFFIX: usize = 4;

static DIGIT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"[0-9]{{{MIN_MASKED_DIGITS},}}")).unwrap());

/// Mask every run of 7+ digits in free text, keeping the last 4 digits.
/// Used on provider error text before it reaches logs.
pub fn mask_digits(text: &str) -> Cow<'_, str> {
    DIGIT_RUN.replace_all(text, |caps: &Captures| {
        let run = &caps[0];
        format!("***{}", &run[run.len() - VISIBLE_SUFFIX..])
    })
}

/// Mask a destination address (phone number, user id, email) for logging.
pub fn mask_recipient(recipient: &str) -> String {
    let chars: Vec<char> = recipient.chars().collect();
    if chars.len() <= VISIBLE_SUFFIX {
        return "***".to_owned();
    }

    let suffix: String = chars[chars.len() - VISIBLE_SUFFIX..].iter().collect();
    format!("***{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_digits_keeps_short_runs() {
        assert_eq!(mask_digits("error code 131047"), "error code 131047");
        assert_eq!(mask_digits("no digits here"), "no digits here");
    }

    #[test]
    fn test_mask_digits_masks_phone_like_runs() {
        assert_eq!(
            mask_digits("recipient 15551234567 is not on whatsapp"),
            "recipient ***4567 is not on whatsapp"
        );
        assert_eq!(
            mask_digits("from 1234567 to 98765432101"),
            "from ***4567 to ***2101"
        );
    }

    #[test]
    fn test_mask_digits_ignores_non_ascii_digits() {
        assert_eq!(
            mask_digits("recipient १२३४५६७ unknown"),
            "recipient १२३४५६७ unknown"
        );
        assert_eq!(
            mask_digits("१२ 15551234567 ٣٤٥٦٧٨٩"),
            "१२ ***4567 ٣٤٥٦٧٨٩"
        );
    }

    #[test]
    fn test_mask_recipient() {
        assert_eq!(mask_recipient("+15551234567"), "***4567");
        assert_eq!(mask_recipient("1234"), "***");
        assert_eq!(mask_recipient("jane.doe@example.com"), "***.com");
    }
}
