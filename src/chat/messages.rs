//! Localized in-band error messages.
//!
//! The raw upstream error is logged; clients only ever see one of these.

use crate::chat::events::GenerationError;
use crate::locale::Language;

pub const CONTENT_FILTERED_EN: &str =
    "Sorry, your question was flagged by the content filter and cannot be answered. Please rephrase it and try again.";
pub const CONTENT_FILTERED_ZH: &str = "抱歉，您的问题触发了内容过滤，无法回答。请换一种方式提问。";
pub const CONTENT_FILTERED_MS: &str =
    "Maaf, soalan anda telah disekat oleh penapis kandungan dan tidak dapat dijawab. Sila ubah soalan anda dan cuba lagi.";
pub const CONTENT_FILTERED_TA: &str =
    "மன்னிக்கவும், உங்கள் கேள்விக்கு என்னால் பதிலளிக்க முடியவில்லை. தயவுசெய்து கேள்வியை மாற்றி மீண்டும் முயற்சிக்கவும்.";

pub const SELF_HARM_EN: &str = "Sorry, I can't help with that. If you or someone you care about needs someone to listen, these helplines are available:\n\
Samaritans of Singapore: 1-767 (24 hours)\n\
Institute of Mental Health: 6389-2222 (24 hours)";
pub const SELF_HARM_ZH: &str = "抱歉，我无法协助处理这个问题。如果您或您关心的人需要有人倾听，可以拨打以下求助热线：\n\
Samaritans of Singapore：1-767（24小时）\n\
Institute of Mental Health：6389-2222（24小时）";
pub const SELF_HARM_MS: &str = "Maaf, saya tidak dapat membantu dengan perkara ini. Jika anda atau seseorang yang anda sayangi memerlukan seseorang untuk mendengar, talian bantuan ini tersedia:\n\
Samaritans of Singapore: 1-767 (24 jam)\n\
Institute of Mental Health: 6389-2222 (24 jam)";
pub const SELF_HARM_TA: &str = "மன்னிக்கவும், நான் அதற்கு உதவ முடியாது. நீங்களோ உங்களுக்கு அன்பான ஒருவரோ மனம் விட்டுப் பேச விரும்பினால், இந்த உதவி எண்கள் உள்ளன:\n\
Samaritans of Singapore: 1-767 (24 மணி நேரம்)\n\
Institute of Mental Health: 6389-2222 (24 மணி நேரம்)";

pub const CONTEXT_TOO_LONG_EN: &str =
    "Sorry, this conversation has become too long for me to process. Please start a new conversation.";
pub const CONTEXT_TOO_LONG_ZH: &str = "抱歉，对话内容过长，无法继续处理。请开始新的对话。";
pub const CONTEXT_TOO_LONG_MS: &str =
    "Maaf, perbualan ini terlalu panjang untuk saya proses. Sila mulakan perbualan baharu.";
pub const CONTEXT_TOO_LONG_TA: &str =
    "மன்னிக்கவும், இந்த உரையாடல் மிகவும் நீளமாக உள்ளதால் என்னால் செயல்படுத்த முடியவில்லை. தயவுசெய்து புதிய உரையாடலைத் தொடங்கவும்.";

pub const GENERIC_FAILURE_EN: &str = "Sorry, something went wrong while preparing the answer. Please try again later.";
pub const GENERIC_FAILURE_ZH: &str = "抱歉，生成回答时出现错误，请稍后再试。";
pub const GENERIC_FAILURE_MS: &str = "Maaf, berlaku ralat semasa menyediakan jawapan. Sila cuba lagi nanti.";
pub const GENERIC_FAILURE_TA: &str =
    "மன்னிக்கவும், பதிலைத் தயாரிக்கும்போது பிழை ஏற்பட்டது. சிறிது நேரம் கழித்து மீண்டும் முயற்சிக்கவும்.";

/// One language's set of error messages.
struct Messages {
    content_filtered: &'static str,
    self_harm: &'static str,
    context_too_long: &'static str,
    generic: &'static str,
}

const ENGLISH: Messages = Messages {
    content_filtered: CONTENT_FILTERED_EN,
    self_harm: SELF_HARM_EN,
    context_too_long: CONTEXT_TOO_LONG_EN,
    generic: GENERIC_FAILURE_EN,
};

const CHINESE: Messages = Messages {
    content_filtered: CONTENT_FILTERED_ZH,
    self_harm: SELF_HARM_ZH,
    context_too_long: CONTEXT_TOO_LONG_ZH,
    generic: GENERIC_FAILURE_ZH,
};

const MALAY: Messages = Messages {
    content_filtered: CONTENT_FILTERED_MS,
    self_harm: SELF_HARM_MS,
    context_too_long: CONTEXT_TOO_LONG_MS,
    generic: GENERIC_FAILURE_MS,
};

const TAMIL: Messages = Messages {
    content_filtered: CONTENT_FILTERED_TA,
    self_harm: SELF_HARM_TA,
    context_too_long: CONTEXT_TOO_LONG_TA,
    generic: GENERIC_FAILURE_TA,
};

pub fn error_message(error: &GenerationError, language: Language) -> &'static str {
    let messages = match language {
        Language::English => &ENGLISH,
        Language::Chinese => &CHINESE,
        Language::Malay => &MALAY,
        Language::Tamil => &TAMIL,
    };
    match error {
        GenerationError::ContentFiltered => messages.content_filtered,
        GenerationError::SelfHarmFiltered => messages.self_harm,
        GenerationError::ContextTooLong => messages.context_too_long,
        GenerationError::Other(_) => messages.generic,
    }
}
