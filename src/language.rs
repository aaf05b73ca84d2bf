//! Best-effort normalization of a browser language tag to its ISO 639 base
//! subtag. Anything that is not a well-formed BCP 47 tag with a registered
//! language yields an empty string, which the backend treats as "no preference".

use isolang::Language;
use language_tags::LanguageTag;

// Registered, but they name no actual language.
const SPECIAL_CODES: &[&str] = &["mis", "mul", "und", "zxx"];

pub fn normalize_language(raw: &str) -> String {
    base_subtag(raw).unwrap_or_default()
}

fn base_subtag(raw: &str) -> Option<String> {
    let cleaned = raw.trim().replace('_', "-");
    if cleaned.is_empty() {
        return None;
    }
    let parsed = LanguageTag::parse(&cleaned).ok()?;
    let tag = parsed.canonicalize().unwrap_or(parsed);

    let primary = tag.primary_language().to_ascii_lowercase();
    if primary.is_empty() || SPECIAL_CODES.contains(&primary.as_str()) {
        return None;
    }
    let language = lookup_language(&primary)?;
    let base = language.to_639_1().unwrap_or_else(|| language.to_639_3());

    // Three-letter spellings of two-letter languages ("eng") are not in the
    // subtag registry, so the remainder is validated under the short code.
    let rest = &tag.as_str()[primary.len()..];
    let registered = LanguageTag::parse(&format!("{base}{rest}")).ok()?;
    registered.validate().ok()?;
    Some(base.to_owned())
}

fn lookup_language(primary: &str) -> Option<Language> {
    match primary.len() {
        2 => Language::from_639_1(primary),
        3 => Language::from_639_3(primary),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_language;

    #[test]
    fn normalize_language_keeps_known_base_subtag() {
        assert_eq!(normalize_language("EN-us"), "en");
        assert_eq!(normalize_language("en"), "en");
        assert_eq!(normalize_language(" pt_BR "), "pt");
        assert_eq!(normalize_language("zh-Hans-CN"), "zh");
        assert_eq!(normalize_language("es-419"), "es");
        assert_eq!(normalize_language("fil-PH"), "fil");
    }

    #[test]
    fn normalize_language_accepts_variants_extensions_and_private_use() {
        assert_eq!(normalize_language("ca-ES-valencia"), "ca");
        assert_eq!(normalize_language("de-CH-1996"), "de");
        assert_eq!(normalize_language("en-US-x-private"), "en");
        assert_eq!(normalize_language("th-TH-u-nu-thai"), "th");
    }

    #[test]
    fn normalize_language_keeps_three_letter_only_languages() {
        assert_eq!(normalize_language("ast"), "ast");
        assert_eq!(normalize_language("gsw-CH"), "gsw");
        assert_eq!(normalize_language("chr"), "chr");
        assert_eq!(normalize_language("kab"), "kab");
    }

    #[test]
    fn normalize_language_canonicalizes_legacy_codes() {
        assert_eq!(normalize_language("eng"), "en");
        assert_eq!(normalize_language("iw-IL"), "he");
        assert_eq!(normalize_language("spa"), "es");
    }

    #[test]
    fn normalize_language_rejects_unknown_or_low_confidence_tags() {
        for raw in [
            "",
            "   ",
            "xx-unknown",
            "xx",
            "und",
            "x-private",
            "en-unknown",
            "en-US-US",
            "e",
            "english",
            "en--us",
            "12",
        ] {
            assert_eq!(normalize_language(raw), "", "tag {raw:?}");
        }
    }
}
