//! Translation of structured queries into MongoDB find options.

use bson::{Bson, Document, doc};
use mongodb::options::FindOptions;

use reslayer_core::query::{Query, SortDirection};

/// Builds the find options for `query`: sort, skip, limit and projection.
///
/// The filter is rendered separately through [`Expr::to_document`](reslayer_core::query::Expr::to_document).
pub(crate) fn find_options(query: &Query) -> FindOptions {
    let mut options = FindOptions::default();

    if let Some(limit) = query.limit {
        options.limit = Some(limit as i64);
    }
    if let Some(skip) = query.offset {
        options.skip = Some(skip as u64);
    }
    if !query.sort.is_empty() {
        options.sort = Some(sort_document(query));
    }
    if let Some(keys) = &query.projection {
        options.projection = Some(projection_document(keys));
    }

    options
}

fn sort_document(query: &Query) -> Document {
    query
        .sort
        .iter()
        .map(|sort| {
            let direction = match sort.direction {
                SortDirection::Asc => 1,
                SortDirection::Desc => -1,
            };
            (sort.field.clone(), Bson::Int32(direction))
        })
        .collect()
}

/// An empty key list still returns the `_id` of every match.
fn projection_document(keys: &[String]) -> Document {
    if keys.is_empty() {
        return doc! { "_id": 1 };
    }

    keys.iter().map(|key| (key.clone(), Bson::Int32(1))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_options_from_query() {
        let query = Query::builder()
            .project(["title"])
            .sort("rank", SortDirection::Desc)
            .sort("title", SortDirection::Asc)
            .offset(5)
            .limit(10)
            .build();

        let options = find_options(&query);

        assert_eq!(options.limit, Some(10));
        assert_eq!(options.skip, Some(5));
        assert_eq!(options.sort, Some(doc! { "rank": -1, "title": 1 }));
        assert_eq!(options.projection, Some(doc! { "title": 1 }));
    }

    #[test]
    fn test_empty_projection_keeps_ids() {
        let query = Query::builder().project(Vec::<String>::new()).build();

        assert_eq!(find_options(&query).projection, Some(doc! { "_id": 1 }));
        assert_eq!(find_options(&Query::new()).projection, None);
    }
}
