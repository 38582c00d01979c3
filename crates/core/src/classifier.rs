use std::sync::Arc;

use maestro_llm::{ChatMessage, ChatRequest, LlmGateway};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Simple,
    Complex,
}

/// Bilingual greeting / thanks / farewell markers.  Matched only on short
/// utterances.
const SIMPLE_KEYWORDS: &[&str] = &[
    "привет", "hello", "hi", "здравствуй",
    "спасибо", "thanks", "thank you",
    "пока", "bye", "goodbye",
    "как дела", "how are you",
    "кто ты", "who are you",
    "что ты", "what are you",
];

/// Bilingual action verbs that mark a request as needing real work.
const COMPLEX_KEYWORDS: &[&str] = &[
    "создай", "create", "сделай", "make",
    "найди", "find", "ищи", "search",
    "отправь", "send", "напиши", "write",
    "проанализируй", "analyze", "анализ",
    "составь", "подготовь", "prepare",
    "план", "plan", "список", "list",
    "сравни", "compare",
    "загрузи", "upload", "скачай", "download",
];

const CLASSIFIER_SYSTEM_PROMPT: &str =
    "You classify user requests. A SIMPLE request is a greeting, thanks, a question about \
     the assistant itself, or anything answerable in one breath without tools or planning. \
     A COMPLEX request needs multiple actions, tools, files, data, or planning. \
     Reply with exactly one word: SIMPLE or COMPLEX.";

/// Maps an utterance to SIMPLE or COMPLEX.  Heuristics first; a cheap model
/// breaks ties; the conservative default on any failure is COMPLEX.
pub struct TaskClassifier {
    gateway: Arc<dyn LlmGateway>,
    fast_model: String,
}

impl TaskClassifier {
    pub fn new(gateway: Arc<dyn LlmGateway>, fast_model: impl Into<String>) -> Self {
        Self { gateway, fast_model: fast_model.into() }
    }

    /// Heuristic layer.  `None` means uncertain.
    pub fn heuristic_classify(request: &str) -> Option<TaskType> {
        let lower = request.trim().to_lowercase();

        if lower.is_empty() {
            return Some(TaskType::Simple);
        }

        if lower.chars().count() < 20 {
            if SIMPLE_KEYWORDS.iter().any(|k| lower.contains(k)) {
                return Some(TaskType::Simple);
            }
            if lower.split_whitespace().count() <= 3 {
                return Some(TaskType::Simple);
            }
        }

        if COMPLEX_KEYWORDS.iter().any(|k| lower.contains(k)) {
            return Some(TaskType::Complex);
        }

        // Several sentences read as structured instructions.
        let terminators = lower.matches(['.', '!', '?']).count();
        if terminators > 2 {
            return Some(TaskType::Complex);
        }

        // Digits or colons usually mean concrete parameters.
        if lower.chars().any(|c| c.is_ascii_digit()) || lower.contains(':') {
            return Some(TaskType::Complex);
        }

        None
    }

    pub async fn classify(&self, request: &str) -> TaskType {
        if let Some(task_type) = Self::heuristic_classify(request) {
            info!(?task_type, "heuristic classification");
            return task_type;
        }

        let messages = vec![
            ChatMessage::system(CLASSIFIER_SYSTEM_PROMPT),
            ChatMessage::user(format!("User request: {request}")),
        ];
        let chat = ChatRequest::new(messages).with_model(self.fast_model.clone());
        match self.gateway.chat(chat).await {
            Ok(response) => {
                let verdict = response.content.trim().to_uppercase();
                let task_type = if verdict.contains("SIMPLE") { TaskType::Simple } else { TaskType::Complex };
                info!(?task_type, "llm classification");
                task_type
            }
            Err(err) => {
                warn!(?err, "classifier llm failed; defaulting to complex");
                TaskType::Complex
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greetings_are_simple() {
        for text in ["привет", "hello", "Hi!", "спасибо большое", "how are you"] {
            assert_eq!(TaskClassifier::heuristic_classify(text), Some(TaskType::Simple), "{text}");
        }
    }

    #[test]
    fn empty_utterance_is_simple() {
        assert_eq!(TaskClassifier::heuristic_classify(""), Some(TaskType::Simple));
        assert_eq!(TaskClassifier::heuristic_classify("   "), Some(TaskType::Simple));
    }

    #[test]
    fn action_verbs_are_complex() {
        for text in [
            "создай файл README.md",
            "составь отчёт по продажам за июнь и отправь на почту",
            "find the latest invoice and compare it with March",
        ] {
            assert_eq!(TaskClassifier::heuristic_classify(text), Some(TaskType::Complex), "{text}");
        }
    }

    #[test]
    fn very_short_unknown_text_is_simple() {
        assert_eq!(TaskClassifier::heuristic_classify("ну ладно"), Some(TaskType::Simple));
    }

    #[test]
    fn digits_and_colons_mean_complex() {
        assert_eq!(
            TaskClassifier::heuristic_classify("перенеси встречу на вторник в 15:30 пожалуйста и предупреди коллег"),
            Some(TaskType::Complex)
        );
    }

    #[test]
    fn many_sentences_mean_complex() {
        let text = "Это первое предложение без глаголов. Это второе предложение тоже. \
                    Вот третье! И четвертое?";
        assert_eq!(TaskClassifier::heuristic_classify(text), Some(TaskType::Complex));
    }

    #[test]
    fn medium_ambiguous_text_is_uncertain() {
        // Long enough to skip the short-text rule, no action verbs, no
        // digits, one sentence: falls through to the LLM layer.
        let text = "расскажи о погоде в городе где мы вчера гуляли";
        assert_eq!(TaskClassifier::heuristic_classify(text), None);
    }
}
