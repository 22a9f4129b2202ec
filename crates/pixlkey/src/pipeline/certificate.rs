//! Certificate of authenticity rendering.

use crate::fingerprint::Fingerprint;
use crate::submission::MetadataFields;

/// Renders the Markdown certificate. Output depends only on its inputs.
///
/// `pre_embed` is the identifier embedded in the image; `post_embed` is
/// the fingerprint of the delivered signed file.
pub fn render_certificate(
    fields: &MetadataFields,
    licence: &str,
    pre_embed: &Fingerprint,
    post_embed: &Fingerprint,
) -> String {
    format!(
        "# Digital Certificate of Authenticity\n\
         \n\
         **Title of Artwork:** *{title}*  \n\
         **Artist (By-line):** {byline}  \n\
         **Creator:** {creator}  \n\
         **Position:** {position}  \n\
         **Creation Date:** {date}  \n\
         **File Type:** PNG  \n\
         **Keywords (Subject):** {keywords}  \n\
         **Intellectual Genre:** {genre}  \n\
         \n\
         ---\n\
         \n\
         ### Description\n\
         \n\
         > *{description}*\n\
         \n\
         ---\n\
         \n\
         ### Rights\n\
         \n\
         *{licence}*  \n\
         {copyright}\n\
         \n\
         ---\n\
         \n\
         ### Additional Details\n\
         \n\
         **Headline:** {headline}  \n\
         **Web Statement:** {web_statement}  \n\
         **Metadata ID (UUID):** {document_id}  \n\
         **Hash of Signed Image:** {post_embed}  \n\
         \n\
         ---\n\
         \n\
         **Certified by:** {byline}  \n\
         **Date of Issue:** {date}\n",
        title = fields.title,
        byline = fields.byline_name,
        creator = fields.creator,
        position = fields.position,
        date = fields.creation_date,
        keywords = fields.keywords,
        genre = fields.genre,
        description = fields.description.replace('\n', "\n> "),
        licence = licence,
        copyright = fields.copyright_notice,
        headline = fields.seo_headline,
        web_statement = fields.web_statement,
        document_id = pre_embed.document_id(),
        post_embed = post_embed,
    )
}
