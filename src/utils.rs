use crate::error::{EdfError, Result};

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// 检查字符串是否为有效的整数
pub fn is_integer_number(s: &str) -> bool {
    let s = s.trim();
    if s.is_empty() {
        return false;
    }

    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// 解析EDF时间字符串为100纳秒单位
pub fn parse_edf_time(s: &str) -> Result<i64> {
    let s = s.trim();

    if s.is_empty() {
        return Err(EdfError::InvalidFormat("Empty time string".to_string()));
    }

    // 处理符号
    let (negative, s) = if let Some(rest) = s.strip_prefix('-') {
        (true, rest)
    } else if let Some(rest) = s.strip_prefix('+') {
        (false, rest)
    } else {
        (false, s)
    };

    // 字段来自 from_utf8_lossy，按字节切片前必须确认全是 ASCII
    if !s.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return Err(EdfError::InvalidFormat(format!("Invalid time value: {:?}", s)));
    }

    let mut value = 0i64;

    if let Some(dot_pos) = s.find('.') {
        // 有小数部分
        let integer_part = &s[..dot_pos];
        let decimal_part = &s[dot_pos + 1..];

        if !integer_part.is_empty() {
            value += integer_part.parse::<i64>()
                .map_err(|_| EdfError::InvalidFormat("Invalid integer part".to_string()))?
                * crate::EDFLIB_TIME_DIMENSION;
        }

        // 解析小数部分（最多7位精度）
        if !decimal_part.is_empty() {
            let decimal_str = if decimal_part.len() > 7 {
                &decimal_part[..7]
            } else {
                decimal_part
            };

            let decimal_value = decimal_str.parse::<i64>()
                .map_err(|_| EdfError::InvalidFormat("Invalid decimal part".to_string()))?;

            let scale = 10i64.pow(7 - decimal_str.len() as u32);
            value += decimal_value * scale;
        }
    } else {
        value = s.parse::<i64>()
            .map_err(|_| EdfError::InvalidFormat("Invalid integer".to_string()))?
            * crate::EDFLIB_TIME_DIMENSION;
    }

    if negative {
        value = -value;
    }

    Ok(value)
}

/// 非本地化的整数解析（避免受系统locale影响）
pub fn atoi_nonlocalized(s: &str) -> i32 {
    let s = s.trim();
    if s.is_empty() {
        return 0;
    }

    s.parse().unwrap_or(0)
}

/// 非本地化的浮点数解析
pub fn atof_nonlocalized(s: &str) -> f64 {
    let s = s.trim();
    if s.is_empty() {
        return 0.0;
    }

    s.parse().unwrap_or(0.0)
}

/// Formats a number so that it fits an EDF ASCII field of `width` bytes,
/// dropping fractional digits when needed.
pub fn fit_number(value: f64, width: usize) -> String {
    let plain = format!("{}", value);
    if plain.len() <= width {
        return plain;
    }

    for decimals in (0..width).rev() {
        let candidate = format!("{:.*}", decimals, value);
        let candidate = if candidate.contains('.') {
            candidate.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            candidate
        };
        if candidate.len() <= width {
            return candidate;
        }
    }

    // 整数部分本身就放不下，只能截断
    plain[..width].to_string()
}

/// Left-aligned, space padded ASCII field of exactly `width` bytes.
pub fn pad_field(s: &str, width: usize) -> Vec<u8> {
    let mut field = vec![b' '; width];
    let ascii = to_ascii(s);
    let bytes = ascii.as_bytes();
    let len = bytes.len().min(width);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

/// 将字符串转换为 7-bit 可打印 ASCII，其余字符替换为 '_'
pub fn to_ascii(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '_' })
        .collect()
}

/// Encodes one EDF+ header subfield: spaces become `_` and an empty value
/// becomes `X` (unknown).
pub fn encode_subfield(s: &str) -> String {
    let s = s.trim();
    if s.is_empty() {
        return "X".to_string();
    }
    to_ascii(s).replace(' ', "_")
}

/// Inverse of [`encode_subfield`] for the "unknown" marker.
pub fn decode_subfield(s: &str) -> String {
    if s == "X" {
        String::new()
    } else {
        s.to_string()
    }
}

pub fn month_abbrev(month: u32) -> &'static str {
    MONTHS[(month.clamp(1, 12) - 1) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_integer_number() {
        assert!(is_integer_number("123"));
        assert!(is_integer_number("-456"));
        assert!(is_integer_number("+789"));
        assert!(is_integer_number("0"));
        assert!(!is_integer_number("12.34"));
        assert!(!is_integer_number("abc"));
        assert!(!is_integer_number(""));
        assert!(!is_integer_number("-"));
    }

    #[test]
    fn test_parse_edf_time() {
        assert_eq!(parse_edf_time("1").unwrap(), 10_000_000);
        assert_eq!(parse_edf_time("1.5").unwrap(), 15_000_000);
        assert_eq!(parse_edf_time("-2.5").unwrap(), -25_000_000);
        assert_eq!(parse_edf_time("+0.0000001").unwrap(), 1);
        assert!(parse_edf_time("  ").is_err());
    }

    #[test]
    fn test_parse_edf_time_rejects_garbled_bytes() {
        let garbled = String::from_utf8_lossy(b"1.12345\xff");
        assert!(matches!(parse_edf_time(&garbled), Err(EdfError::InvalidFormat(_))));
        assert!(parse_edf_time("1.2.3").is_err());
        assert!(parse_edf_time("1e3").is_err());
    }

    #[test]
    fn test_fit_number_respects_width() {
        assert_eq!(fit_number(-3276.8, 8), "-3276.8");
        assert_eq!(fit_number(0.1234567, 8), "0.123457");
        assert_eq!(fit_number(32767.0, 8), "32767");
        assert!(fit_number(-0.00001234567, 8).len() <= 8);
    }

    #[test]
    fn test_subfield_encoding() {
        assert_eq!(encode_subfield("Tran Thi B"), "Tran_Thi_B");
        assert_eq!(encode_subfield(""), "X");
        assert_eq!(encode_subfield("Nguyễn"), "Nguy_n");
        assert_eq!(decode_subfield("X"), "");
        assert_eq!(decode_subfield("sub-0001"), "sub-0001");
    }

    #[test]
    fn test_pad_field() {
        assert_eq!(pad_field("EEG", 6), b"EEG   ".to_vec());
        assert_eq!(pad_field("ABCDEFGH", 4), b"ABCD".to_vec());
    }
}
